//! Error types for the buildchain engine.
//!
//! Load-time errors (`CyclicDependencyError`, `UnknownStageError`,
//! `InvalidFilterError`, ...) reject a configuration and leave the active
//! graph in force. Run-time errors are recorded on stage instances and never
//! abort unrelated runs.

use crate::core::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for buildchain operations.
#[derive(Debug, Error)]
pub enum BuildchainError {
    /// A configuration failed to load.
    #[error("{0}")]
    Load(#[from] LoadError),

    /// A stage id was not found.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// A stage status transition was rejected.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// A run id was not found.
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// A paging token could not be decoded.
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for buildchain operations.
pub type BuildchainResult<T> = Result<T, BuildchainError>;

/// Metadata about a load error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "LOAD-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors that reject a configuration load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The dependency graph contains a cycle.
    #[error("{0}")]
    CyclicDependency(#[from] CyclicDependencyError),

    /// A dependency edge references a stage that does not exist.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// A stage references a VCS root that does not exist.
    #[error("{0}")]
    UnknownVcsRoot(#[from] UnknownVcsRootError),

    /// A trigger branch filter did not compile.
    #[error("{0}")]
    InvalidFilter(#[from] InvalidFilterError),

    /// Two stages share the same id.
    #[error("Duplicate stage id '{0}'")]
    DuplicateStage(String),

    /// A stage definition is malformed.
    #[error("Stage '{stage}' is invalid: {reason}")]
    InvalidStage {
        /// The offending stage.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The raw configuration could not be parsed.
    #[error("Configuration parse error: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Returns diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        match self {
            Self::CyclicDependency(err) => err.error_info(),
            Self::UnknownStage(err) => ContractErrorInfo::new(
                "LOAD-002-UNKNOWN_STAGE",
                err.to_string(),
            )
            .with_fix_hint("Check the dependency's stage id for typos.")
            .with_context_entry("stage", err.stage_id.clone()),
            Self::UnknownVcsRoot(err) => ContractErrorInfo::new(
                "LOAD-003-UNKNOWN_VCS_ROOT",
                err.to_string(),
            )
            .with_fix_hint("Declare the VCS root before attaching it to a stage.")
            .with_context_entry("vcs_root", err.root_id.clone()),
            Self::InvalidFilter(err) => ContractErrorInfo::new(
                "LOAD-004-INVALID_FILTER",
                err.to_string(),
            )
            .with_fix_hint("Use '+:pattern' or '-:pattern' rules with '*' and '?' wildcards.")
            .with_context_entry("pattern", err.pattern.clone()),
            Self::DuplicateStage(id) => {
                ContractErrorInfo::new("LOAD-005-DUPLICATE_STAGE", self.to_string())
                    .with_context_entry("stage", id.clone())
            }
            Self::InvalidStage { stage, .. } => {
                ContractErrorInfo::new("LOAD-006-INVALID_STAGE", self.to_string())
                    .with_context_entry("stage", stage.clone())
            }
            Self::Parse(_) | Self::Io(_) => {
                ContractErrorInfo::new("LOAD-007-PARSE", self.to_string())
            }
        }
    }
}

/// Error raised when the pipeline graph contains a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cyclic dependency: {}", .cycle.join(" -> "))]
pub struct CyclicDependencyError {
    /// The stages forming the cycle; the first stage is repeated at the end.
    pub cycle: Vec<String>,
}

impl CyclicDependencyError {
    /// Creates a new cyclic dependency error.
    #[must_use]
    pub fn new(cycle: Vec<String>) -> Self {
        Self { cycle }
    }

    /// Returns the distinct stage ids in the cycle.
    #[must_use]
    pub fn members(&self) -> &[String] {
        match self.cycle.split_last() {
            Some((last, rest)) if rest.first() == Some(last) => rest,
            _ => &self.cycle,
        }
    }

    /// Returns diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new(
            "LOAD-001-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", self.cycle.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.")
    }
}

/// Error raised when a stage id does not exist.
#[derive(Debug, Clone, Error)]
#[error("Unknown stage '{stage_id}'{}", .referenced_by.as_ref().map(|s| format!(" (referenced by '{s}')")).unwrap_or_default())]
pub struct UnknownStageError {
    /// The missing stage id.
    pub stage_id: String,
    /// The stage whose dependency edge referenced it, if any.
    pub referenced_by: Option<String>,
}

impl UnknownStageError {
    /// Creates an error for a lookup of a missing stage.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            referenced_by: None,
        }
    }

    /// Creates an error for a dependency edge pointing at a missing stage.
    #[must_use]
    pub fn referenced_by(stage_id: impl Into<String>, referrer: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            referenced_by: Some(referrer.into()),
        }
    }
}

/// Error raised when a stage attaches a VCS root that is not declared.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' references unknown VCS root '{root_id}'")]
pub struct UnknownVcsRootError {
    /// The stage.
    pub stage: String,
    /// The missing root id.
    pub root_id: String,
}

/// Error raised when a branch filter pattern does not compile.
#[derive(Debug, Clone, Error)]
#[error("Invalid branch filter '{pattern}' on stage '{stage}': {reason}")]
pub struct InvalidFilterError {
    /// The stage declaring the filter.
    pub stage: String,
    /// The offending rule.
    pub pattern: String,
    /// Why it was rejected.
    pub reason: String,
}

impl InvalidFilterError {
    /// Creates a new invalid filter error.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        pattern: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when a requested status transition is not allowed.
#[derive(Debug, Clone, Error)]
#[error("Invalid transition for stage '{stage_id}' in run {run_id}: {from} -> {to}")]
pub struct InvalidTransitionError {
    /// The run.
    pub run_id: Uuid,
    /// The stage.
    pub stage_id: String,
    /// The current status.
    pub from: StageStatus,
    /// The rejected target status.
    pub to: StageStatus,
}

/// Error raised when the step runner cannot execute a stage.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Step execution failed for stage '{stage_id}': {reason}")]
pub struct StepExecutionError {
    /// The stage.
    pub stage_id: String,
    /// What went wrong.
    pub reason: String,
}

impl StepExecutionError {
    /// Creates a new step execution error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            reason: reason.into(),
        }
    }
}

/// Records why a stage was cancelled by an upstream outcome.
///
/// This is not returned to callers: it ends up in the cancelled instance's
/// detail, since a dependency violation is a normal terminal state.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Dependency '{upstream}' of stage '{stage_id}' finished as {upstream_status}")]
pub struct DependencyViolationError {
    /// The cancelled stage.
    pub stage_id: String,
    /// The upstream whose outcome violated the edge.
    pub upstream: String,
    /// The upstream's terminal status.
    pub upstream_status: StageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "Build");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"Build".to_string()));
    }

    #[test]
    fn test_cyclic_dependency_error() {
        let err = CyclicDependencyError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.members(), ["a", "b", "c"]);
        assert_eq!(err.error_info().code, "LOAD-001-CYCLE");
    }

    #[test]
    fn test_unknown_stage_message() {
        let err = UnknownStageError::referenced_by("Buld", "TestSuite");
        assert_eq!(err.to_string(), "Unknown stage 'Buld' (referenced by 'TestSuite')");

        let err = UnknownStageError::new("Missing");
        assert_eq!(err.to_string(), "Unknown stage 'Missing'");
    }

    #[test]
    fn test_load_error_codes() {
        let err = LoadError::from(InvalidFilterError::new("Build", "x:main", "unknown prefix"));
        let info = err.error_info();
        assert_eq!(info.code, "LOAD-004-INVALID_FILTER");
        assert_eq!(info.context.get("pattern"), Some(&"x:main".to_string()));

        let err = LoadError::DuplicateStage("Build".to_string());
        assert_eq!(err.error_info().code, "LOAD-005-DUPLICATE_STAGE");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = InvalidTransitionError {
            run_id: Uuid::nil(),
            stage_id: "Build".to_string(),
            from: StageStatus::Succeeded,
            to: StageStatus::Running,
        };
        assert!(err.to_string().contains("succeeded -> running"));
    }
}
