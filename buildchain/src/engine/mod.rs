//! The engine: trigger intake, run creation and the global concurrency limit.
//!
//! An [`Engine`] owns the Stage Definition Registry and the Run State Store.
//! Each accepted change event becomes a run driven by its own
//! [`RunScheduler`] task; all schedulers share one semaphore of build slots.

mod config;
mod handle;

pub use config::{EngineConfig, MAX_CONCURRENCY_ENV, RETRY_BASE_DELAY_ENV};
pub use handle::RunHandle;
pub use crate::run::TriggerScope;

use crate::core::ChangeEvent;
use crate::definition::{PipelineConfig, PipelineGraph, StageRegistry};
use crate::errors::{BuildchainError, BuildchainResult, LoadError};
use crate::events::{EventSink, NoOpEventSink};
use crate::interfaces::{ArtifactStore, StepRunner, TriggerSource};
use crate::run::{
    plan, PageRequest, Run, RunFilter, RunPage, RunPages, RunScheduler, RunStateStore,
    SchedulerContext, StageInstance,
};
use dashmap::DashMap;
use futures::StreamExt;
use handle::RunControl;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// The pipeline orchestration engine.
pub struct Engine {
    config: EngineConfig,
    registry: StageRegistry,
    store: Arc<RunStateStore>,
    runner: Arc<dyn StepRunner>,
    artifacts: Arc<dyn ArtifactStore>,
    slots: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, RunControl>>,
}

impl Engine {
    /// Creates an engine with an empty active graph.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn StepRunner>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        Self {
            slots: Arc::new(Semaphore::new(config.effective_concurrency())),
            registry: StageRegistry::with_sink(Arc::clone(&sink)),
            store: Arc::new(RunStateStore::with_sink(sink)),
            config,
            runner,
            artifacts,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Publishes events to `sink`.
    ///
    /// Replaces the registry and the store, so call it before loading a
    /// configuration.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.registry = StageRegistry::with_sink(Arc::clone(&sink));
        self.store = Arc::new(RunStateStore::with_sink(sink));
        self
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and activates a pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns the `LoadError` that rejected it; the active graph is kept.
    pub fn load(&self, config: &PipelineConfig) -> Result<Arc<PipelineGraph>, LoadError> {
        self.registry.load(config)
    }

    /// Loads a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns the `LoadError` that rejected it.
    pub fn load_json(&self, raw: &str) -> Result<Arc<PipelineGraph>, LoadError> {
        self.registry.load_json(raw)
    }

    /// Loads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns the `LoadError` that rejected it.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<PipelineGraph>, LoadError> {
        self.registry.load_file(path)
    }

    /// The active graph.
    #[must_use]
    pub fn current_graph(&self) -> Arc<PipelineGraph> {
        self.registry.current_graph()
    }

    /// Starts a run for a change event if any stage's trigger matches it.
    ///
    /// # Errors
    ///
    /// See [`start_run`](Self::start_run).
    pub fn handle_change(&self, event: ChangeEvent) -> BuildchainResult<Option<RunHandle>> {
        self.start_run(event, TriggerScope::Vcs)
    }

    /// Starts a run of the active graph. Must be called within a tokio
    /// runtime.
    ///
    /// Returns `None` when the scope triggers no stage.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if an explicit scope names an unknown stage.
    pub fn start_run(
        &self,
        event: ChangeEvent,
        scope: TriggerScope,
    ) -> BuildchainResult<Option<RunHandle>> {
        let graph = self.registry.current_graph();
        let Some(plan) = plan(&graph, &event, &scope)? else {
            debug!(
                repository = %event.repository,
                branch = %event.branch,
                "No stage triggered by change"
            );
            return Ok(None);
        };

        let run = self.store.create_run(&graph, event, &plan);
        let run_id = run.id;

        let (tx, rx) = mpsc::unbounded_channel();
        let control = RunControl::new(tx.clone());
        let ctx = SchedulerContext {
            store: Arc::clone(&self.store),
            runner: Arc::clone(&self.runner),
            artifacts: Arc::clone(&self.artifacts),
            slots: Arc::clone(&self.slots),
            parameters: Arc::new(self.config.parameters.clone()),
            retry: self.config.retry_policy(),
        };
        let scheduler = RunScheduler::new(run_id, graph, ctx, tx, rx)?;

        self.active.insert(run_id, control.clone());
        let active = Arc::clone(&self.active);
        let span = info_span!("run", run_id = %run_id);
        let join = tokio::spawn(
            async move {
                let status = scheduler.run().await;
                active.remove(&run_id);
                info!(status = %status, "Run finished");
                status
            }
            .instrument(span),
        );

        Ok(Some(RunHandle::new(
            run_id,
            control,
            Arc::clone(&self.store),
            join,
        )))
    }

    /// Consumes a trigger source until it closes, starting a run per
    /// matching event. Returns the handles of the started runs.
    pub async fn listen(&self, source: &dyn TriggerSource) -> Vec<RunHandle> {
        let mut events = source.subscribe();
        let mut handles = Vec::new();
        while let Some(event) = events.next().await {
            match self.handle_change(event) {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {}
                Err(err) => error!(error = %err, "Failed to start run"),
            }
        }
        handles
    }

    /// Cancels a run by id.
    ///
    /// Returns false when the run already finished or was already
    /// cancelled; nothing changes then.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run.
    pub fn cancel_run(&self, run_id: Uuid, reason: &str) -> BuildchainResult<bool> {
        if let Some(control) = self.active.get(&run_id) {
            return Ok(control.cancel(reason));
        }
        self.store.get_run(run_id).map(|_| false)
    }

    /// Cancels one stage of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `UnknownStage`.
    pub fn cancel_stage(&self, run_id: Uuid, stage_id: &str, reason: &str) -> BuildchainResult<()> {
        self.store.get_instance(run_id, stage_id)?;
        if let Some(control) = self.active.get(&run_id) {
            control.cancel_stage(stage_id, reason);
        }
        Ok(())
    }

    /// A snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run.
    pub fn get_run(&self, run_id: Uuid) -> BuildchainResult<Run> {
        self.store.get_run(run_id)
    }

    /// A snapshot of one stage instance.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `UnknownStage`.
    pub fn get_instance(&self, run_id: Uuid, stage_id: &str) -> BuildchainResult<StageInstance> {
        self.store.get_instance(run_id, stage_id)
    }

    /// One page of run summaries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageToken` for a foreign token.
    pub fn list_runs(&self, filter: &RunFilter, page: &PageRequest) -> BuildchainResult<RunPage> {
        self.store.list_runs(filter, page)
    }

    /// Lazily iterates a listing page by page.
    #[must_use]
    pub fn run_pages(&self, filter: RunFilter, limit: usize) -> RunPages<'_> {
        self.store.run_pages(filter, limit)
    }

    /// Removes a finished run from the store.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the run is still active, or `RunNotFound`.
    pub fn archive_run(&self, run_id: Uuid) -> BuildchainResult<Run> {
        if self.active.contains_key(&run_id) {
            return Err(BuildchainError::Internal(format!(
                "run {run_id} is still active"
            )));
        }
        self.store
            .archive(run_id)
            .ok_or(BuildchainError::RunNotFound(run_id))
    }

    /// The run state store.
    #[must_use]
    pub fn store(&self) -> Arc<RunStateStore> {
        Arc::clone(&self.store)
    }

    /// Number of runs whose scheduler is still active.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active.len()
    }

    /// Free build slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailurePolicy, RunStatus};
    use crate::definition::StageConfig;
    use crate::errors::CyclicDependencyError;
    use crate::testing::{fast_config, push, scenario_config, StageScript, TestEngine};
    use std::time::Duration;

    #[test]
    fn test_rejected_load_keeps_active_graph() {
        let harness = TestEngine::new(fast_config(2));
        let active = harness
            .load(&scenario_config(FailurePolicy::FailToStart))
            .unwrap();

        let mut cyclic = scenario_config(FailurePolicy::FailToStart);
        cyclic.stages[0] = cyclic.stages[0]
            .clone()
            .depends_on("Package", FailurePolicy::FailToStart);
        let err = harness.load(&cyclic).unwrap_err();
        assert!(matches!(
            err,
            LoadError::CyclicDependency(CyclicDependencyError { .. })
        ));
        assert!(Arc::ptr_eq(&active, &harness.engine.current_graph()));
        assert_eq!(harness.events.events_of_type("graph.rejected").len(), 1);
    }

    #[test]
    fn test_load_json() {
        let harness = TestEngine::new(fast_config(2));
        let graph = harness
            .engine
            .load_json(
                r#"{
                    "project_id": "Docs",
                    "stages": [
                        { "id": "Render", "steps": [ { "command": "mdbook build" } ] },
                        { "id": "Publish", "dependencies": [ { "upstream": "Render" } ] }
                    ]
                }"#,
            )
            .unwrap();
        assert_eq!(graph.project_id(), "Docs");
        assert_eq!(graph.topological_order(), ["Render", "Publish"]);
    }

    #[tokio::test]
    async fn test_empty_graph_starts_nothing() {
        let harness = TestEngine::new(fast_config(2));
        assert!(harness.engine.handle_change(push("main", "a")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_scope_rejects_unknown_stage() {
        let harness = TestEngine::new(fast_config(2));
        harness.load(&scenario_config(FailurePolicy::FailToStart)).unwrap();
        let err = harness.trigger(&["Deploy"]).unwrap_err();
        assert!(matches!(err, BuildchainError::UnknownStage(_)));
    }

    #[tokio::test]
    async fn test_explicit_scope_runs_dependency_closure() {
        let harness = TestEngine::new(fast_config(2));
        harness
            .load(&scenario_config(FailurePolicy::FailToStart).with_stage(StageConfig::new("Audit")))
            .unwrap();

        let handle = harness.trigger(&["Test"]).unwrap();
        let run_id = handle.run_id();
        assert_eq!(handle.wait().await.unwrap(), RunStatus::Succeeded);

        let run = harness.engine.get_run(run_id).unwrap();
        assert!(run.instance("Audit").is_none());
        assert!(run.instance("Build").is_some());
        assert!(run.instance("Package").is_some());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let harness = TestEngine::new(fast_config(2));
        let missing = Uuid::now_v7();
        assert!(matches!(
            harness.engine.cancel_run(missing, "x"),
            Err(BuildchainError::RunNotFound(id)) if id == missing
        ));
        assert!(harness.engine.get_run(missing).is_err());
    }

    #[tokio::test]
    async fn test_archive_requires_finished_run() {
        let harness = TestEngine::new(fast_config(2));
        harness.runner.set_script("Build", StageScript::succeed().gated());
        harness.load(&scenario_config(FailurePolicy::FailToStart)).unwrap();

        let handle = harness.push("main", "a").unwrap();
        let run_id = handle.run_id();
        harness
            .runner
            .wait_started("Build", 1, Duration::from_secs(5))
            .await;
        assert!(matches!(
            harness.engine.archive_run(run_id),
            Err(BuildchainError::Internal(_))
        ));

        harness.runner.release("Build");
        handle.wait().await.unwrap();
        let archived = harness.engine.archive_run(run_id).unwrap();
        assert_eq!(archived.status, RunStatus::Succeeded);
        assert!(matches!(
            harness.engine.get_run(run_id),
            Err(BuildchainError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_runs_pages_newest_first() {
        let harness = TestEngine::new(fast_config(4));
        harness.runner.set_script("Lint", StageScript::fail(1));
        harness.load(&scenario_config(FailurePolicy::FailToStart)).unwrap();

        let mut ids = Vec::new();
        for revision in ["r1", "r2", "r3"] {
            let handle = harness.push("main", revision).unwrap();
            ids.push(handle.run_id());
            handle.wait().await.unwrap();
        }

        let first = harness
            .engine
            .list_runs(&RunFilter::any(), &PageRequest::first(2))
            .unwrap();
        let revisions: Vec<&str> = first.runs.iter().map(|r| r.revision.as_str()).collect();
        assert_eq!(revisions, ["r3", "r2"]);

        let token = first.next.expect("more runs");
        let second = harness
            .engine
            .list_runs(&RunFilter::any(), &PageRequest::after(token, 2))
            .unwrap();
        assert_eq!(second.runs.len(), 1);
        assert_eq!(second.runs[0].id, ids[0]);
        assert!(second.next.is_none());

        let failed = harness
            .engine
            .run_pages(RunFilter::any().with_status(RunStatus::Failed), 1)
            .summaries()
            .count();
        assert_eq!(failed, 3);
        assert_eq!(
            harness
                .engine
                .run_pages(RunFilter::any().with_branch("develop"), 10)
                .summaries()
                .count(),
            0
        );
    }

    #[test]
    fn test_available_slots_follow_config() {
        let harness = TestEngine::new(fast_config(0));
        assert_eq!(harness.engine.available_slots(), 1);
        assert_eq!(harness.engine.active_runs(), 0);
    }
}
