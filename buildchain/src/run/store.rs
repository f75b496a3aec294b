//! The Run State Store: the single source of truth for run and stage state.
//!
//! Each run lives behind its own mutex, so every transition of a run is
//! serialized while different runs never contend. The scheduler of a run is
//! its only writer; queries read snapshots.

use super::instance::{Run, StageInstance, TransitionDetails};
use super::plan::RunPlan;
use super::query::{PageRequest, PageToken, RunFilter, RunPage, RunPages};
use crate::core::{ChangeEvent, FailurePolicy, RunStatus, StageStatus};
use crate::definition::PipelineGraph;
use crate::errors::{
    BuildchainError, BuildchainResult, DependencyViolationError, InvalidTransitionError,
    UnknownStageError,
};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::utils::{generate_uuid_v7, now_utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of an accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transitioned {
    /// Status before the transition.
    pub from: StageStatus,
    /// Terminal run status, if this transition completed the run.
    pub completed: Option<RunStatus>,
}

/// In-memory store of all runs.
pub struct RunStateStore {
    runs: DashMap<Uuid, Arc<Mutex<Run>>>,
    // creation sequence -> run id, for newest-first listings
    order: RwLock<BTreeMap<u64, Uuid>>,
    sequence: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl RunStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoOpEventSink))
    }

    /// Creates an empty store publishing events to `sink`.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self {
            runs: DashMap::new(),
            order: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            sink,
        }
    }

    /// Instantiates a run of `graph` for `trigger`.
    ///
    /// Every member of the plan gets a `pending` instance; planned skips
    /// move to `skipped` immediately.
    pub fn create_run(&self, graph: &PipelineGraph, trigger: ChangeEvent, plan: &RunPlan) -> Run {
        let now = now_utc();
        let id = generate_uuid_v7();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut instances = BTreeMap::new();
        for stage_id in &plan.members {
            let kind = graph.stage(stage_id).map(|s| s.kind).unwrap_or_default();
            let mut instance =
                StageInstance::new(stage_id, kind, plan.triggered.contains(stage_id), now);
            instance.failure_tolerated = failure_tolerated(graph, plan, stage_id);
            if plan.skipped.contains(stage_id) {
                instance.apply(
                    StageStatus::Skipped,
                    TransitionDetails::none().with_detail("trigger filter excludes the change"),
                    now,
                );
            }
            instances.insert(stage_id.clone(), instance);
        }

        let run = Run {
            id,
            sequence,
            project_id: graph.project_id().to_string(),
            graph_version: graph.version(),
            trigger,
            created_at: now,
            finished_at: None,
            status: RunStatus::Running,
            instances,
            problems: Vec::new(),
            violations: Vec::new(),
            cancel_reason: None,
        };

        info!(
            run_id = %id,
            branch = %run.trigger.branch,
            revision = %run.trigger.revision,
            stages = run.instances.len(),
            skipped = plan.skipped.len(),
            "Created run"
        );
        self.sink.try_emit(&PipelineEvent::RunCreated {
            run_id: id,
            branch: run.trigger.branch.clone(),
            revision: run.trigger.revision.clone(),
            stages: run.instances.len(),
        });
        for stage_id in &plan.members {
            if plan.skipped.contains(stage_id) {
                self.sink.try_emit(&PipelineEvent::StageTransitioned {
                    run_id: id,
                    stage_id: stage_id.clone(),
                    from: StageStatus::Pending,
                    to: StageStatus::Skipped,
                    detail: None,
                });
            }
        }

        self.runs.insert(id, Arc::new(Mutex::new(run.clone())));
        self.order.write().insert(sequence, id);
        run
    }

    fn entry(&self, run_id: Uuid) -> BuildchainResult<Arc<Mutex<Run>>> {
        self.runs
            .get(&run_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(BuildchainError::RunNotFound(run_id))
    }

    /// A snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown or archived run.
    pub fn get_run(&self, run_id: Uuid) -> BuildchainResult<Run> {
        Ok(self.entry(run_id)?.lock().clone())
    }

    /// A snapshot of one stage instance.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `UnknownStage`.
    pub fn get_instance(&self, run_id: Uuid, stage_id: &str) -> BuildchainResult<StageInstance> {
        self.entry(run_id)?
            .lock()
            .instances
            .get(stage_id)
            .cloned()
            .ok_or_else(|| UnknownStageError::new(stage_id).into())
    }

    /// Reads a run under its lock without cloning it.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run.
    pub fn with_run<R>(&self, run_id: Uuid, f: impl FnOnce(&Run) -> R) -> BuildchainResult<R> {
        let entry = self.entry(run_id)?;
        let run = entry.lock();
        Ok(f(&run))
    }

    /// Moves a stage instance to `to`.
    ///
    /// When the transition makes every instance terminal, the run's status
    /// and finish time are set in the same critical section.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `to` is not reachable from the current
    /// status, or `RunNotFound` / `UnknownStage`.
    pub fn transition(
        &self,
        run_id: Uuid,
        stage_id: &str,
        to: StageStatus,
        details: TransitionDetails,
    ) -> BuildchainResult<Transitioned> {
        let entry = self.entry(run_id)?;
        let mut run = entry.lock();

        let instance = run
            .instances
            .get_mut(stage_id)
            .ok_or_else(|| UnknownStageError::new(stage_id))?;
        let from = instance.status;
        if !from.can_transition_to(to, instance.kind) {
            return Err(InvalidTransitionError {
                run_id,
                stage_id: stage_id.to_string(),
                from,
                to,
            }
            .into());
        }

        let now = now_utc();
        let detail = details.detail.clone();
        instance.apply(to, details, now);
        debug!(run_id = %run_id, stage = %stage_id, from = %from, to = %to, "Stage transition");
        self.sink.try_emit(&PipelineEvent::StageTransitioned {
            run_id,
            stage_id: stage_id.to_string(),
            from,
            to,
            detail,
        });

        let mut completed = None;
        if to.is_terminal() && run.all_terminal() {
            let status = run.compute_status();
            run.status = status;
            run.finished_at = Some(now);
            completed = Some(status);
            info!(run_id = %run_id, status = %status, "Run completed");
            self.sink.try_emit(&PipelineEvent::RunCompleted { run_id, status });
        }

        Ok(Transitioned { from, completed })
    }

    /// Records an `ADD_PROBLEM` violation; the run becomes degraded.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run.
    pub fn record_problem(
        &self,
        run_id: Uuid,
        problem: DependencyViolationError,
    ) -> BuildchainResult<()> {
        info!(run_id = %run_id, stage = %problem.stage_id, upstream = %problem.upstream, "Run degraded");
        self.entry(run_id)?.lock().problems.push(problem);
        Ok(())
    }

    /// Records a `FAIL_TO_START` violation; the run will fail.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run.
    pub fn record_violation(
        &self,
        run_id: Uuid,
        violation: DependencyViolationError,
    ) -> BuildchainResult<()> {
        self.entry(run_id)?.lock().violations.push(violation);
        Ok(())
    }

    /// Records the reason of an explicit run cancellation. The first one wins.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run.
    pub fn set_cancel_reason(&self, run_id: Uuid, reason: &str) -> BuildchainResult<()> {
        let entry = self.entry(run_id)?;
        let mut run = entry.lock();
        if run.cancel_reason.is_none() {
            run.cancel_reason = Some(reason.to_string());
        }
        Ok(())
    }

    /// One page of run summaries matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageToken` for a token this store did not issue.
    pub fn list_runs(&self, filter: &RunFilter, page: &PageRequest) -> BuildchainResult<RunPage> {
        let upper = match &page.token {
            Some(token) => token.sequence()?,
            None => u64::MAX,
        };
        let limit = page.limit.max(1);

        // snapshot ids first so no run lock is taken under the index lock
        let candidates: Vec<(u64, Uuid)> = self
            .order
            .read()
            .range(..upper)
            .rev()
            .map(|(seq, id)| (*seq, *id))
            .collect();

        let mut runs = Vec::with_capacity(limit);
        let mut last = None;
        let mut more = false;
        for (seq, id) in candidates {
            let Some(entry) = self.runs.get(&id).map(|r| Arc::clone(r.value())) else {
                continue;
            };
            let run = entry.lock();
            if !filter.matches(&run) {
                continue;
            }
            if runs.len() == limit {
                more = true;
                break;
            }
            runs.push(run.summary());
            last = Some(seq);
        }

        Ok(RunPage {
            runs,
            next: last.filter(|_| more).map(PageToken::after),
        })
    }

    /// Lazily iterates a listing page by page.
    #[must_use]
    pub fn run_pages(&self, filter: RunFilter, limit: usize) -> RunPages<'_> {
        RunPages::new(self, filter, limit)
    }

    /// Removes a run, for external retention policies.
    pub fn archive(&self, run_id: Uuid) -> Option<Run> {
        let (_, entry) = self.runs.remove(&run_id)?;
        let run = entry.lock().clone();
        self.order.write().remove(&run.sequence);
        Some(run)
    }

    /// Number of `running` instances across all runs.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.runs
            .iter()
            .map(|entry| entry.value().lock().running_count())
            .sum()
    }

    /// Number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no runs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl Default for RunStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStateStore")
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

/// True when the stage has dependents in the run and none of them reaches it
/// over a `FAIL_TO_START` edge.
fn failure_tolerated(graph: &PipelineGraph, plan: &RunPlan, stage_id: &str) -> bool {
    let mut dependents = graph
        .downstream_of(stage_id)
        .iter()
        .filter(|d| plan.contains(d) && !plan.skipped.contains(*d))
        .filter_map(|d| graph.stage(d)?.edge_to(stage_id))
        .peekable();
    dependents.peek().is_some()
        && dependents.all(|edge| edge.policy != FailurePolicy::FailToStart)
}
