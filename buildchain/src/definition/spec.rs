//! Compiled, immutable stage definitions.

use super::config::{PollingMode, StageConfig, TriggerConfig, VcsRoot};
use super::filter::BranchFilter;
use crate::core::{ChangeEvent, FailurePolicy, StageKind};
use crate::errors::{InvalidFilterError, LoadError, UnknownVcsRootError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One opaque build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The command handed to the step runner. May reference `%param%`s.
    pub command: String,
    /// Working directory, relative to the checkout. May reference `%param%`s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Keep executing later steps if this one exits non-zero.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl StepSpec {
    /// Creates a step running `command`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
            working_dir: None,
            continue_on_failure: false,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Lets later steps run even if this one fails.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Display name, falling back to the command.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }
}

/// A snapshot dependency on an upstream stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The upstream stage id.
    pub upstream: String,
    /// What a failed upstream means for this stage.
    #[serde(default, rename = "on_failure")]
    pub policy: FailurePolicy,
}

impl DependencyEdge {
    /// Creates a new dependency edge.
    #[must_use]
    pub fn new(upstream: impl Into<String>, policy: FailurePolicy) -> Self {
        Self {
            upstream: upstream.into(),
            policy,
        }
    }
}

/// A VCS trigger with its branch filter compiled.
#[derive(Debug, Clone)]
pub struct StageTrigger {
    /// Compiled branch filter.
    pub filter: BranchFilter,
    /// Polling mode, for the trigger source.
    pub polling: PollingMode,
}

/// The immutable definition of one stage, shared by all runs.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// Unique stage id.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
    /// Stage kind.
    pub kind: StageKind,
    /// The resolved VCS root, if any.
    pub vcs_root: Option<VcsRoot>,
    /// Steps, in execution order. Always empty for composite stages.
    pub steps: Vec<StepSpec>,
    /// Snapshot dependencies.
    pub dependencies: Vec<DependencyEdge>,
    /// Compiled VCS triggers.
    pub triggers: Vec<StageTrigger>,
    /// Artifact path patterns published on success.
    pub artifacts: Vec<String>,
    /// Extra attempts after a failed one.
    pub retry_count: u32,
}

impl StageDefinition {
    /// Validates and compiles a raw stage record.
    ///
    /// Dependency targets are checked by the graph, which knows every id.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown VCS root, a branch filter that does
    /// not compile, a composite stage with steps, or a duplicate edge.
    pub fn compile(
        config: &StageConfig,
        roots: &HashMap<String, VcsRoot>,
    ) -> Result<Self, LoadError> {
        if config.id.trim().is_empty() {
            return Err(LoadError::InvalidStage {
                stage: config.id.clone(),
                reason: "stage id cannot be empty".to_string(),
            });
        }
        if config.kind == StageKind::Composite && !config.steps.is_empty() {
            return Err(LoadError::InvalidStage {
                stage: config.id.clone(),
                reason: "composite stages cannot declare steps".to_string(),
            });
        }
        for (i, edge) in config.dependencies.iter().enumerate() {
            if config.dependencies[..i].iter().any(|e| e.upstream == edge.upstream) {
                return Err(LoadError::InvalidStage {
                    stage: config.id.clone(),
                    reason: format!("duplicate dependency on '{}'", edge.upstream),
                });
            }
        }

        let vcs_root = match &config.vcs_root {
            Some(root_id) => Some(roots.get(root_id).cloned().ok_or_else(|| {
                UnknownVcsRootError {
                    stage: config.id.clone(),
                    root_id: root_id.clone(),
                }
            })?),
            None => None,
        };

        let default_branch = vcs_root.as_ref().map(|r| r.default_branch.as_str());
        let triggers = config
            .triggers
            .iter()
            .map(|t| compile_trigger(&config.id, t, default_branch))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            kind: config.kind,
            vcs_root,
            steps: config.steps.clone(),
            dependencies: config.dependencies.clone(),
            triggers,
            artifacts: config.artifacts.clone(),
            retry_count: config.retry_count,
        })
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Returns true if the stage is composite.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.kind == StageKind::Composite
    }

    /// Returns true if the stage declares any VCS trigger.
    #[must_use]
    pub fn has_triggers(&self) -> bool {
        !self.triggers.is_empty()
    }

    /// Returns true if the event comes from this stage's repository.
    ///
    /// A stage without a VCS root accepts every repository.
    #[must_use]
    pub fn watches_repository(&self, repository: &str) -> bool {
        self.vcs_root
            .as_ref()
            .map_or(true, |root| root.matches_repository(repository))
    }

    /// Returns true if one of the stage's triggers fires for the event.
    #[must_use]
    pub fn is_triggered_by(&self, event: &ChangeEvent) -> bool {
        self.watches_repository(&event.repository)
            && self.triggers.iter().any(|t| t.filter.matches(&event.branch))
    }

    /// Returns the edge to `upstream`, if this stage depends on it.
    #[must_use]
    pub fn edge_to(&self, upstream: &str) -> Option<&DependencyEdge> {
        self.dependencies.iter().find(|e| e.upstream == upstream)
    }
}

fn compile_trigger(
    stage: &str,
    trigger: &TriggerConfig,
    default_branch: Option<&str>,
) -> Result<StageTrigger, InvalidFilterError> {
    Ok(StageTrigger {
        filter: BranchFilter::compile(stage, &trigger.branch_filter, default_branch)?,
        polling: trigger.polling,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> HashMap<String, VcsRoot> {
        let root = VcsRoot::new("GitRepository", "https://example.com/app.git");
        HashMap::from([(root.id.clone(), root)])
    }

    #[test]
    fn test_compile_stage() {
        let config = StageConfig::new("Build")
            .with_name("1. Build & Install")
            .with_vcs_root("GitRepository")
            .with_step(StepSpec::new("npm install").named("Install NPM Dependencies"))
            .with_trigger(TriggerConfig::branches(["+:<default>"]))
            .with_artifact("dist/*");

        let def = StageDefinition::compile(&config, &roots()).unwrap();
        assert_eq!(def.display_name(), "1. Build & Install");
        assert_eq!(def.steps.len(), 1);
        assert!(def.has_triggers());
        assert!(!def.is_composite());

        assert!(def.is_triggered_by(&ChangeEvent::new("GitRepository", "main", "r1")));
        assert!(!def.is_triggered_by(&ChangeEvent::new("GitRepository", "develop", "r1")));
        assert!(!def.is_triggered_by(&ChangeEvent::new("other-repo", "main", "r1")));
    }

    #[test]
    fn test_unknown_vcs_root() {
        let config = StageConfig::new("Build").with_vcs_root("Nope");
        let err = StageDefinition::compile(&config, &roots()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownVcsRoot(_)));
    }

    #[test]
    fn test_composite_with_steps_rejected() {
        let config = StageConfig::composite("All").with_step(StepSpec::new("echo"));
        let err = StageDefinition::compile(&config, &roots()).unwrap_err();
        assert!(matches!(err, LoadError::InvalidStage { .. }));
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let config = StageConfig::new("Test")
            .depends_on("Build", FailurePolicy::FailToStart)
            .depends_on("Build", FailurePolicy::Ignore);
        assert!(StageDefinition::compile(&config, &roots()).is_err());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = StageConfig::new("Build").with_trigger(TriggerConfig::branches(["?:main"]));
        let err = StageDefinition::compile(&config, &roots()).unwrap_err();
        assert!(matches!(err, LoadError::InvalidFilter(_)));
    }

    #[test]
    fn test_stage_without_root_watches_everything() {
        let def = StageDefinition::compile(&StageConfig::new("Lint"), &roots()).unwrap();
        assert!(def.watches_repository("anything"));
        assert!(!def.is_triggered_by(&ChangeEvent::new("anything", "main", "r1")));
    }

    #[test]
    fn test_step_builder() {
        let step = StepSpec::new("npm run lint").in_dir("web").continue_on_failure();
        assert_eq!(step.working_dir.as_deref(), Some("web"));
        assert!(step.continue_on_failure);
    }
}
