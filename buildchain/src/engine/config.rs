//! Engine tuning.

use crate::pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

/// Environment variable overriding [`EngineConfig::max_concurrency`].
pub const MAX_CONCURRENCY_ENV: &str = "BUILDCHAIN_MAX_CONCURRENCY";
/// Environment variable overriding [`EngineConfig::retry_base_delay_ms`].
pub const RETRY_BASE_DELAY_ENV: &str = "BUILDCHAIN_RETRY_BASE_DELAY_MS";

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum `running` stages across all runs (the build agents).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Global `%name%` parameters available to every step.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Base delay before re-running a failed attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound of the retry delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            parameters: BTreeMap::new(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BUILDCHAIN_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrency: parse_env(MAX_CONCURRENCY_ENV).unwrap_or(defaults.max_concurrency),
            retry_base_delay_ms: parse_env(RETRY_BASE_DELAY_ENV)
                .unwrap_or(defaults.retry_base_delay_ms),
            ..defaults
        }
    }

    /// Sets the concurrency limit. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Adds a global parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn with_retry_base_delay_ms(mut self, delay: u64) -> Self {
        self.retry_base_delay_ms = delay;
        self
    }

    /// Sets the maximum retry delay.
    #[must_use]
    pub fn with_retry_max_delay_ms(mut self, delay: u64) -> Self {
        self.retry_max_delay_ms = delay;
        self
    }

    /// The concurrency limit actually applied.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    /// Backoff template for stage retries.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay_ms(self.retry_base_delay_ms)
            .with_max_delay_ms(self.retry_max_delay_ms.max(self.retry_base_delay_ms))
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert!(config.parameters.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_max_concurrency(0)
            .with_parameter("env.GITHUB_TOKEN", "t")
            .with_retry_base_delay_ms(10)
            .with_retry_max_delay_ms(5);

        assert_eq!(config.effective_concurrency(), 1);
        assert_eq!(config.parameters["env.GITHUB_TOKEN"], "t");
        let policy = config.retry_policy();
        assert_eq!(policy.base_delay_ms, 10);
        assert_eq!(policy.max_delay_ms, 10);
        assert_eq!(policy.max_retries, 0);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_str(r#"{ "max_concurrency": 2 }"#).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry_max_delay_ms, 30_000);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var(MAX_CONCURRENCY_ENV, "7");
        std::env::set_var(RETRY_BASE_DELAY_ENV, "soon");
        let config = EngineConfig::from_env();
        std::env::remove_var(MAX_CONCURRENCY_ENV);
        std::env::remove_var(RETRY_BASE_DELAY_ENV);

        assert_eq!(config.max_concurrency, 7);
        assert_eq!(config.retry_base_delay_ms, 1000);
    }
}
