//! Raw configuration records: the load-time input of the registry.
//!
//! The records are plain serde structs so any front end (JSON here) can
//! produce them. They are validated and compiled into a
//! [`PipelineGraph`](super::PipelineGraph) by the registry.

use super::spec::{DependencyEdge, StepSpec};
use crate::core::{FailurePolicy, StageKind};
use crate::errors::LoadError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A version control root that stages check out and triggers watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsRoot {
    /// Unique id of the root.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Repository url.
    pub url: String,
    /// Default branch, e.g. `refs/heads/main`.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "refs/heads/main".to_string()
}

impl VcsRoot {
    /// Creates a VCS root with `refs/heads/main` as default branch.
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: url.into(),
            default_branch: default_branch(),
        }
    }

    /// Sets the default branch.
    #[must_use]
    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    /// Returns true if a change event's repository refers to this root.
    #[must_use]
    pub fn matches_repository(&self, repository: &str) -> bool {
        repository == self.id || repository.trim_end_matches('/') == self.url.trim_end_matches('/')
    }
}

/// How the trigger source learns about changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PollingMode {
    /// The repository pushes change notifications.
    #[default]
    Push,
    /// The trigger source polls the repository.
    Poll {
        /// Seconds between polls.
        interval_secs: u64,
    },
}

/// A VCS trigger declared on a stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Branch filter rules (`+:pattern`, `-:pattern`).
    #[serde(default)]
    pub branch_filter: Vec<String>,
    /// Polling mode.
    #[serde(default)]
    pub polling: PollingMode,
}

impl TriggerConfig {
    /// Creates a trigger with the given branch rules.
    #[must_use]
    pub fn branches(rules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            branch_filter: rules.into_iter().map(Into::into).collect(),
            polling: PollingMode::Push,
        }
    }

    /// Sets the polling mode.
    #[must_use]
    pub fn with_polling(mut self, polling: PollingMode) -> Self {
        self.polling = polling;
        self
    }
}

/// One stage as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage id.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stage kind.
    #[serde(default)]
    pub kind: StageKind,
    /// Attached VCS root id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs_root: Option<String>,
    /// Steps, in execution order.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Snapshot dependencies.
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    /// VCS triggers.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Artifact path patterns published on success.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Extra attempts after a failed one.
    #[serde(default)]
    pub retry_count: u32,
}

impl StageConfig {
    /// Creates a normal stage with no steps.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: StageKind::Normal,
            vcs_root: None,
            steps: Vec::new(),
            dependencies: Vec::new(),
            triggers: Vec::new(),
            artifacts: Vec::new(),
            retry_count: 0,
        }
    }

    /// Creates a composite stage.
    #[must_use]
    pub fn composite(id: impl Into<String>) -> Self {
        Self {
            kind: StageKind::Composite,
            ..Self::new(id)
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches a VCS root.
    #[must_use]
    pub fn with_vcs_root(mut self, root_id: impl Into<String>) -> Self {
        self.vcs_root = Some(root_id.into());
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a snapshot dependency.
    #[must_use]
    pub fn depends_on(mut self, upstream: impl Into<String>, policy: FailurePolicy) -> Self {
        self.dependencies.push(DependencyEdge::new(upstream, policy));
        self
    }

    /// Adds a VCS trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Adds an artifact path pattern.
    #[must_use]
    pub fn with_artifact(mut self, pattern: impl Into<String>) -> Self {
        self.artifacts.push(pattern.into());
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }
}

/// A complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Project id.
    pub project_id: String,
    /// Project display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Declared VCS roots.
    #[serde(default)]
    pub vcs_roots: Vec<VcsRoot>,
    /// Stages, in declaration order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            project_name: None,
            vcs_roots: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Sets the project display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    /// Declares a VCS root.
    #[must_use]
    pub fn with_vcs_root(mut self, root: VcsRoot) -> Self {
        self.vcs_roots.push(root);
        self
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Parse` if the JSON does not describe a configuration.
    pub fn from_json(raw: &str) -> Result<Self, LoadError> {
        serde_json::from_str(raw).map_err(|e| LoadError::Parse(e.to_string()))
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Io` if the file cannot be read, or
    /// `LoadError::Parse` if its content is not a configuration.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
