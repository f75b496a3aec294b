//! Pipeline configurations and an engine harness for tests.

use super::artifacts::InMemoryArtifactStore;
use super::runner::ScriptedStepRunner;
use crate::core::{ChangeEvent, FailurePolicy};
use crate::definition::{PipelineConfig, PipelineGraph, StageConfig, StepSpec, TriggerConfig, VcsRoot};
use crate::engine::{Engine, EngineConfig, RunHandle, TriggerScope};
use crate::errors::{BuildchainError, BuildchainResult, LoadError};
use crate::events::CollectingEventSink;
use std::sync::Arc;

/// Id of the VCS root used by the fixtures.
pub const REPOSITORY: &str = "app";

/// The `Build -> {Test, Lint} -> Package` pipeline.
///
/// `Build` triggers on the default branch and publishes `dist/*`. Every
/// edge is `FAIL_TO_START` except `Package -> Lint`, which uses
/// `lint_policy`.
#[must_use]
pub fn scenario_config(lint_policy: FailurePolicy) -> PipelineConfig {
    PipelineConfig::new("WebApp")
        .with_name("Web Application")
        .with_vcs_root(VcsRoot::new(REPOSITORY, "https://git.example.com/app.git"))
        .with_stage(
            StageConfig::new("Build")
                .with_vcs_root(REPOSITORY)
                .with_step(StepSpec::new("npm ci").named("Install"))
                .with_step(StepSpec::new("npm run build").named("Compile"))
                .with_trigger(TriggerConfig::branches(["+:<default>"]))
                .with_artifact("dist/*"),
        )
        .with_stage(
            StageConfig::new("Test")
                .with_step(StepSpec::new("npm test"))
                .depends_on("Build", FailurePolicy::FailToStart),
        )
        .with_stage(
            StageConfig::new("Lint")
                .with_step(StepSpec::new("npm run lint"))
                .depends_on("Build", FailurePolicy::FailToStart),
        )
        .with_stage(
            StageConfig::new("Package")
                .with_step(StepSpec::new("tar czf app.tgz dist"))
                .depends_on("Test", FailurePolicy::FailToStart)
                .depends_on("Lint", lint_policy),
        )
}

/// [`scenario_config`] with a composite `Release` over `Test` and `Package`.
#[must_use]
pub fn release_config() -> PipelineConfig {
    scenario_config(FailurePolicy::FailToStart).with_stage(
        StageConfig::composite("Release")
            .depends_on("Test", FailurePolicy::FailToStart)
            .depends_on("Package", FailurePolicy::FailToStart),
    )
}

/// A push to `branch` of the fixture repository.
#[must_use]
pub fn push(branch: &str, revision: &str) -> ChangeEvent {
    ChangeEvent::new(REPOSITORY, format!("refs/heads/{branch}"), revision)
}

/// An engine config with near-zero retry backoff.
#[must_use]
pub fn fast_config(max_concurrency: usize) -> EngineConfig {
    EngineConfig::new()
        .with_max_concurrency(max_concurrency)
        .with_retry_base_delay_ms(1)
        .with_retry_max_delay_ms(5)
}

/// An [`Engine`] wired to scripted collaborators and a collecting sink.
#[derive(Debug)]
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// The step runner the engine drives.
    pub runner: Arc<ScriptedStepRunner>,
    /// The artifact store the engine publishes to.
    pub artifacts: Arc<InMemoryArtifactStore>,
    /// Every event the engine emitted.
    pub events: Arc<CollectingEventSink>,
}

impl TestEngine {
    /// Creates a harness with every stage succeeding.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_runner(config, ScriptedStepRunner::new())
    }

    /// Creates a harness around a prepared runner.
    #[must_use]
    pub fn with_runner(config: EngineConfig, runner: ScriptedStepRunner) -> Self {
        let runner = Arc::new(runner);
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let engine = Engine::new(config, runner.clone(), artifacts.clone())
            .with_event_sink(events.clone());
        Self {
            engine,
            runner,
            artifacts,
            events,
        }
    }

    /// Loads a pipeline.
    ///
    /// # Errors
    ///
    /// Returns the `LoadError` that rejected it.
    pub fn load(&self, config: &PipelineConfig) -> Result<Arc<PipelineGraph>, LoadError> {
        self.engine.load(config)
    }

    /// Starts a run for a push to `branch`, failing if nothing triggered.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when no stage is triggered by the push.
    pub fn push(&self, branch: &str, revision: &str) -> BuildchainResult<RunHandle> {
        self.engine
            .handle_change(push(branch, revision))?
            .ok_or_else(|| BuildchainError::Internal(format!("push to '{branch}' started no run")))
    }

    /// Starts a run of the given stages and their dependency closure.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage`, or `Internal` if nothing was started.
    pub fn trigger(&self, stages: &[&str]) -> BuildchainResult<RunHandle> {
        let scope = TriggerScope::Stages(stages.iter().map(|s| (*s).to_string()).collect());
        self.engine
            .start_run(push("main", "manual"), scope)?
            .ok_or_else(|| BuildchainError::Internal("manual trigger started no run".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;

    #[test]
    fn test_scenario_config_loads() {
        let graph = PipelineGraph::from_config(&scenario_config(FailurePolicy::AddProblem)).unwrap();
        assert_eq!(graph.topological_order().first().map(String::as_str), Some("Build"));
        assert_eq!(
            graph.stage("Package").unwrap().edge_to("Lint").unwrap().policy,
            FailurePolicy::AddProblem
        );
    }

    #[test]
    fn test_release_config_has_composite() {
        let graph = PipelineGraph::from_config(&release_config()).unwrap();
        assert_eq!(graph.stage("Release").unwrap().kind, StageKind::Composite);
        assert_eq!(graph.topological_order().last().map(String::as_str), Some("Release"));
    }

    #[test]
    fn test_push_uses_full_ref() {
        let event = push("main", "abc123");
        assert_eq!(event.branch, "refs/heads/main");
        assert_eq!(event.short_branch(), "main");
    }
}
