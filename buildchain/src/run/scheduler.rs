//! The Run Scheduler: drives one run from creation to a terminal status.
//!
//! Each run gets its own scheduler task consuming an event loop of stage
//! completions and cancellation requests. Stage attempts run in spawned
//! tasks that hand their concurrency permit back with the outcome, so a
//! slot is released only after the terminal transition is recorded.
//!
//! After every terminal transition only the stage's direct dependents are
//! re-evaluated, through a worklist so cascades stay iterative.

use super::instance::{CancelCause, TransitionDetails};
use super::params;
use super::store::RunStateStore;
use crate::cancellation::CancellationToken;
use crate::core::{ArtifactRef, EdgeVerdict, FailurePolicy, RunStatus, StageStatus};
use crate::definition::{PipelineGraph, StageDefinition};
use crate::errors::{DependencyViolationError, StepExecutionError};
use crate::interfaces::{ArtifactStore, StepOutcome, StepRequest, StepRunner};
use crate::pipeline::RetryPolicy;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Messages consumed by a run's event loop.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// A stage task finished. Carries the slot it held.
    StageFinished {
        /// The stage.
        stage_id: String,
        /// What happened.
        outcome: StageOutcome,
        /// The concurrency slot, released once the outcome is recorded.
        permit: OwnedSemaphorePermit,
    },
    /// Cancel every non-terminal stage of the run.
    CancelRun {
        /// Reason recorded on the instances.
        reason: String,
    },
    /// Cancel one stage; the cancellation cascades to its dependents.
    CancelStage {
        /// The stage.
        stage_id: String,
        /// Reason recorded on the instance.
        reason: String,
    },
}

/// Result of a stage task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// An attempt succeeded and the stage's artifacts were published.
    Succeeded {
        /// Attempts made.
        attempts: u32,
        /// Step outcomes of the last attempt.
        steps: Vec<StepOutcome>,
        /// Published artifacts.
        artifacts: Vec<ArtifactRef>,
    },
    /// The stage failed after its last attempt.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Step outcomes of the last attempt.
        steps: Vec<StepOutcome>,
        /// Why it failed.
        detail: String,
    },
    /// The stage was cancelled while running.
    Cancelled {
        /// Attempts made.
        attempts: u32,
    },
}

/// The collaborators a scheduler drives.
#[derive(Clone)]
pub struct SchedulerContext {
    /// Run state.
    pub store: Arc<RunStateStore>,
    /// Executes stage steps.
    pub runner: Arc<dyn StepRunner>,
    /// Stores published artifacts.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Global concurrency slots, shared by all runs.
    pub slots: Arc<Semaphore>,
    /// Global `%name%` parameters.
    pub parameters: Arc<BTreeMap<String, String>>,
    /// Backoff for stages with a retry count; `max_retries` is per stage.
    pub retry: RetryPolicy,
}

type PermitFuture = BoxFuture<'static, Result<OwnedSemaphorePermit, AcquireError>>;

/// Drives one run.
pub struct RunScheduler {
    run_id: Uuid,
    graph: Arc<PipelineGraph>,
    ctx: SchedulerContext,
    tx: UnboundedSender<SchedulerMessage>,
    rx: UnboundedReceiver<SchedulerMessage>,
    members: HashSet<String>,
    // queued normal stages waiting for a slot, FIFO
    ready: VecDeque<String>,
    acquiring: Option<PermitFuture>,
    running: HashMap<String, Arc<CancellationToken>>,
    in_flight: usize,
}

impl RunScheduler {
    /// Creates the scheduler of a run already in the store.
    ///
    /// `tx` must be the sender paired with `rx`; stage tasks report through it.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run is not in the store.
    pub fn new(
        run_id: Uuid,
        graph: Arc<PipelineGraph>,
        ctx: SchedulerContext,
        tx: UnboundedSender<SchedulerMessage>,
        rx: UnboundedReceiver<SchedulerMessage>,
    ) -> crate::errors::BuildchainResult<Self> {
        let members = ctx
            .store
            .with_run(run_id, |run| run.instances.keys().cloned().collect())?;
        Ok(Self {
            run_id,
            graph,
            ctx,
            tx,
            rx,
            members,
            ready: VecDeque::new(),
            acquiring: None,
            running: HashMap::new(),
            in_flight: 0,
        })
    }

    /// Runs the event loop until every stage is terminal and every stage
    /// task has returned. Returns the run's terminal status.
    pub async fn run(mut self) -> RunStatus {
        let initial: Vec<String> = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| self.members.contains(*id))
            .cloned()
            .collect();
        self.evaluate_all(initial);

        loop {
            if self.settled() {
                break;
            }
            if self.acquiring.is_none() && !self.ready.is_empty() {
                self.acquiring = Some(Box::pin(Arc::clone(&self.ctx.slots).acquire_owned()));
            }
            if self.acquiring.is_none() && self.in_flight == 0 {
                self.break_deadlock();
                continue;
            }

            tokio::select! {
                permit = next_permit(&mut self.acquiring) => {
                    self.acquiring = None;
                    match permit {
                        Ok(permit) => self.start_next(permit),
                        Err(_) => {
                            error!(run_id = %self.run_id, "Concurrency slots closed");
                            self.cancel_run("concurrency slots closed".to_string());
                        }
                    }
                }
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message),
                    // unreachable while self.tx is alive
                    None => break,
                },
            }
        }

        self.ctx
            .store
            .with_run(self.run_id, |run| run.status)
            .unwrap_or(RunStatus::Failed)
    }

    fn settled(&self) -> bool {
        self.in_flight == 0
            && self
                .ctx
                .store
                .with_run(self.run_id, |run| run.all_terminal())
                .unwrap_or(true)
    }

    fn status_of(&self, stage_id: &str) -> Option<StageStatus> {
        self.ctx
            .store
            .with_run(self.run_id, |run| run.stage_status(stage_id))
            .ok()
            .flatten()
    }

    fn handle(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::StageFinished {
                stage_id,
                outcome,
                permit,
            } => {
                self.finish(&stage_id, outcome);
                drop(permit);
            }
            SchedulerMessage::CancelRun { reason } => self.cancel_run(reason),
            SchedulerMessage::CancelStage { stage_id, reason } => {
                self.cancel_stage(&stage_id, &reason);
            }
        }
    }

    /// Records a transition; rejected transitions are logged, never fatal.
    fn transition(&self, stage_id: &str, to: StageStatus, details: TransitionDetails) -> bool {
        match self.ctx.store.transition(self.run_id, stage_id, to, details) {
            Ok(done) => {
                if let Some(status) = done.completed {
                    debug!(run_id = %self.run_id, status = %status, "Last stage settled");
                }
                true
            }
            Err(err) => {
                error!(run_id = %self.run_id, stage = %stage_id, error = %err, "Rejected transition");
                false
            }
        }
    }

    fn evaluate_all(&mut self, stages: impl IntoIterator<Item = String>) {
        let mut worklist: VecDeque<String> = stages.into_iter().collect();
        let mut newly_ready = Vec::new();

        while let Some(stage_id) = worklist.pop_front() {
            if self.status_of(&stage_id) != Some(StageStatus::Pending) {
                continue;
            }
            if let Some(settled) = self.evaluate(&stage_id, &mut newly_ready) {
                worklist.extend(self.dependents_in_run(&settled));
            }
        }

        newly_ready.sort_by_key(|id| self.graph.resolver().position(id));
        self.ready.extend(newly_ready);
    }

    fn dependents_in_run(&self, stage_id: &str) -> Vec<String> {
        self.graph
            .downstream_of(stage_id)
            .iter()
            .filter(|d| self.members.contains(*d))
            .cloned()
            .collect()
    }

    /// Decides a pending stage. Returns the stage id if it reached a
    /// terminal status, so its dependents get evaluated.
    fn evaluate(&self, stage_id: &str, newly_ready: &mut Vec<String>) -> Option<String> {
        let stage = self.graph.stage(stage_id)?;

        let mut waiting = false;
        let mut violated = Vec::new();
        let mut degraded = Vec::new();
        for edge in self.graph.upstream_of(stage_id) {
            if !self.members.contains(&edge.upstream) {
                continue;
            }
            let status = self.status_of(&edge.upstream)?;
            let violation = || DependencyViolationError {
                stage_id: stage_id.to_string(),
                upstream: edge.upstream.clone(),
                upstream_status: status,
            };
            match edge.policy.evaluate(status) {
                EdgeVerdict::Waiting => waiting = true,
                EdgeVerdict::Satisfied => {}
                EdgeVerdict::Degraded => degraded.push(violation()),
                EdgeVerdict::Violated => violated.push(violation()),
            }
        }

        if stage.is_composite() {
            if waiting {
                return None;
            }
            self.record_problems(degraded);
            if !self.transition(stage_id, StageStatus::Queued, TransitionDetails::none()) {
                return None;
            }
            let (to, details) = match violated.first() {
                None => (StageStatus::Succeeded, TransitionDetails::none()),
                Some(first) => (
                    StageStatus::Failed,
                    TransitionDetails::none().with_detail(first.to_string()),
                ),
            };
            for violation in violated {
                let _ = self.ctx.store.record_violation(self.run_id, violation);
            }
            info!(run_id = %self.run_id, stage = %stage_id, status = %to, "Composite stage resolved");
            self.transition(stage_id, to, details);
            return Some(stage_id.to_string());
        }

        if let Some(first) = violated.first().cloned() {
            info!(
                run_id = %self.run_id,
                stage = %stage_id,
                upstream = %first.upstream,
                upstream_status = %first.upstream_status,
                "Cancelling stage after {} violation",
                FailurePolicy::FailToStart
            );
            for violation in violated {
                let _ = self.ctx.store.record_violation(self.run_id, violation);
            }
            self.transition(
                stage_id,
                StageStatus::Cancelled,
                TransitionDetails::none().with_cancel_cause(CancelCause::Dependency(first)),
            );
            return Some(stage_id.to_string());
        }
        if waiting {
            return None;
        }

        self.record_problems(degraded);
        if self.transition(stage_id, StageStatus::Queued, TransitionDetails::none()) {
            newly_ready.push(stage_id.to_string());
        }
        None
    }

    fn record_problems(&self, problems: Vec<DependencyViolationError>) {
        for problem in problems {
            let _ = self.ctx.store.record_problem(self.run_id, problem);
        }
    }

    fn start_next(&mut self, permit: OwnedSemaphorePermit) {
        while let Some(stage_id) = self.ready.pop_front() {
            if self.status_of(&stage_id) != Some(StageStatus::Queued) {
                continue;
            }
            let Some(stage) = self.graph.stage(&stage_id).cloned() else {
                continue;
            };
            if !self.transition(&stage_id, StageStatus::Running, TransitionDetails::none()) {
                continue;
            }

            let token = Arc::new(CancellationToken::new());
            self.running.insert(stage_id.clone(), Arc::clone(&token));
            self.in_flight += 1;

            let task = StageTask {
                run_id: self.run_id,
                env: self.stage_env(&stage),
                retry: self.ctx.retry.clone().with_max_retries(stage.retry_count),
                stage,
                runner: Arc::clone(&self.ctx.runner),
                artifacts: Arc::clone(&self.ctx.artifacts),
                parameters: Arc::clone(&self.ctx.parameters),
                token,
            };
            let tx = self.tx.clone();
            let span = info_span!("stage", run_id = %self.run_id, stage = %stage_id);
            tokio::spawn(
                async move {
                    let outcome = task.execute().await;
                    let _ = tx.send(SchedulerMessage::StageFinished {
                        stage_id,
                        outcome,
                        permit,
                    });
                }
                .instrument(span),
            );
            return;
        }
        // nothing left to start; the permit drops here
    }

    /// Run parameters plus the artifact locations of succeeded upstreams.
    fn stage_env(&self, stage: &StageDefinition) -> BTreeMap<String, String> {
        self.ctx
            .store
            .with_run(self.run_id, |run| {
                let mut env = BTreeMap::from([
                    ("run.id".to_string(), run.id.to_string()),
                    ("vcs.branch".to_string(), run.trigger.branch.clone()),
                    ("vcs.revision".to_string(), run.trigger.revision.clone()),
                    ("vcs.repository".to_string(), run.trigger.repository.clone()),
                    ("stage.id".to_string(), stage.id.clone()),
                ]);
                for edge in &stage.dependencies {
                    let Some(upstream) = run.instance(&edge.upstream) else {
                        continue;
                    };
                    if upstream.status == StageStatus::Succeeded {
                        let locations: Vec<String> =
                            upstream.artifacts.iter().map(ArtifactRef::location).collect();
                        env.insert(format!("dep.{}.artifacts", edge.upstream), locations.join(","));
                    }
                }
                env
            })
            .unwrap_or_default()
    }

    fn finish(&mut self, stage_id: &str, outcome: StageOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.running.remove(stage_id);

        if self.status_of(stage_id) != Some(StageStatus::Running) {
            // cancelled while the runner was still busy
            debug!(run_id = %self.run_id, stage = %stage_id, "Discarding outcome of cancelled stage");
            return;
        }

        let (to, details) = match outcome {
            StageOutcome::Succeeded {
                attempts,
                steps,
                artifacts,
            } => (
                StageStatus::Succeeded,
                TransitionDetails::none()
                    .with_attempts(attempts)
                    .with_step_results(steps)
                    .with_artifacts(artifacts),
            ),
            StageOutcome::Failed {
                attempts,
                steps,
                detail,
            } => {
                warn!(run_id = %self.run_id, stage = %stage_id, attempts, detail = %detail, "Stage failed");
                (
                    StageStatus::Failed,
                    TransitionDetails::none()
                        .with_attempts(attempts)
                        .with_step_results(steps)
                        .with_detail(detail),
                )
            }
            StageOutcome::Cancelled { attempts } => (
                StageStatus::Cancelled,
                TransitionDetails::none()
                    .with_attempts(attempts)
                    .with_cancel_cause(CancelCause::Requested {
                        reason: "cancelled while running".to_string(),
                    }),
            ),
        };

        if self.transition(stage_id, to, details) {
            self.evaluate_all(self.dependents_in_run(stage_id));
        }
    }

    fn cancel_run(&mut self, reason: String) {
        let already_done = self
            .ctx
            .store
            .with_run(self.run_id, |run| run.all_terminal())
            .unwrap_or(true);
        if already_done {
            debug!(run_id = %self.run_id, "Ignoring cancellation of a finished run");
            return;
        }

        info!(run_id = %self.run_id, reason = %reason, "Cancelling run");
        let _ = self.ctx.store.set_cancel_reason(self.run_id, &reason);
        self.ready.clear();
        self.acquiring = None;

        let order: Vec<String> = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| self.members.contains(*id))
            .cloned()
            .collect();
        for stage_id in &order {
            self.cancel_one(stage_id, &reason);
        }
    }

    fn cancel_stage(&mut self, stage_id: &str, reason: &str) {
        if !self.members.contains(stage_id) {
            warn!(run_id = %self.run_id, stage = %stage_id, "Cannot cancel a stage outside the run");
            return;
        }
        if self.cancel_one(stage_id, reason) {
            info!(run_id = %self.run_id, stage = %stage_id, reason = %reason, "Cancelled stage");
            self.evaluate_all(self.dependents_in_run(stage_id));
        }
    }

    /// Cancels a non-terminal stage and aborts its task. Returns false if
    /// the stage was already terminal.
    fn cancel_one(&mut self, stage_id: &str, reason: &str) -> bool {
        match self.status_of(stage_id) {
            Some(status) if !status.is_terminal() => {}
            _ => return false,
        }
        if let Some(token) = self.running.get(stage_id) {
            token.cancel(reason);
        }
        self.transition(
            stage_id,
            StageStatus::Cancelled,
            TransitionDetails::none().with_cancel_cause(CancelCause::Requested {
                reason: reason.to_string(),
            }),
        )
    }

    /// No task in flight and nothing queued, yet stages are not terminal.
    fn break_deadlock(&mut self) {
        let stuck: Vec<String> = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| self.members.contains(*id))
            .filter(|id| self.status_of(id).is_some_and(|s| !s.is_terminal()))
            .cloned()
            .collect();
        error!(run_id = %self.run_id, remaining = ?stuck, "Deadlocked run; cancelling remaining stages");
        for stage_id in &stuck {
            self.cancel_one(stage_id, "unschedulable");
        }
    }
}

async fn next_permit(
    acquiring: &mut Option<PermitFuture>,
) -> Result<OwnedSemaphorePermit, AcquireError> {
    match acquiring {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// One stage's execution, owned by its spawned task.
struct StageTask {
    run_id: Uuid,
    stage: StageDefinition,
    env: BTreeMap<String, String>,
    retry: RetryPolicy,
    runner: Arc<dyn StepRunner>,
    artifacts: Arc<dyn ArtifactStore>,
    parameters: Arc<BTreeMap<String, String>>,
    token: Arc<CancellationToken>,
}

enum Attempt {
    Finished(Result<crate::interfaces::StepResult, StepExecutionError>),
    Cancelled,
}

impl StageTask {
    async fn execute(self) -> StageOutcome {
        let mut params = (*self.parameters).clone();
        params.extend(self.env.clone());
        let steps = match params::expand_steps(&self.stage.steps, &params) {
            Ok(steps) => steps,
            Err(reason) => {
                return StageOutcome::Failed {
                    attempts: 0,
                    steps: Vec::new(),
                    detail: StepExecutionError::new(&self.stage.id, reason).to_string(),
                }
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = StepRequest {
                run_id: self.run_id,
                stage_id: self.stage.id.clone(),
                steps: steps.clone(),
                env: self.env.clone(),
                attempt,
            };
            debug!(attempt, steps = steps.len(), "Running steps");

            let (detail, outcomes) = match self.attempt(&request).await {
                Attempt::Cancelled => return StageOutcome::Cancelled { attempts: attempt },
                Attempt::Finished(Ok(result)) => match result.evaluate(&steps) {
                    Ok(()) => return self.publish(attempt, result.steps).await,
                    Err(reason) => (reason, result.steps),
                },
                Attempt::Finished(Err(err)) => (err.to_string(), Vec::new()),
            };

            if !self.retry.should_retry(attempt) || self.token.is_cancelled() {
                return StageOutcome::Failed {
                    attempts: attempt,
                    steps: outcomes,
                    detail,
                };
            }
            let delay = self.retry.delay_after(attempt);
            warn!(attempt, delay = ?delay, detail = %detail, "Attempt failed; retrying");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.token.cancelled() => return StageOutcome::Cancelled { attempts: attempt },
            }
        }
    }

    /// Runs one attempt. On cancellation the runner is told to abort and
    /// awaited, so the slot is not freed while it still works.
    async fn attempt(&self, request: &StepRequest) -> Attempt {
        let run = self.runner.run_steps(request);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => Attempt::Finished(result),
            () = self.token.cancelled() => {
                self.runner.cancel(self.run_id, &self.stage.id).await;
                let _ = run.await;
                Attempt::Cancelled
            }
        }
    }

    async fn publish(&self, attempts: u32, steps: Vec<StepOutcome>) -> StageOutcome {
        let mut published = Vec::new();
        for pattern in &self.stage.artifacts {
            if self.token.is_cancelled() {
                return StageOutcome::Cancelled { attempts };
            }
            match self
                .artifacts
                .publish(self.run_id, &self.stage.id, pattern)
                .await
            {
                Ok(refs) => published.extend(refs),
                Err(err) => {
                    return StageOutcome::Failed {
                        attempts,
                        steps,
                        detail: format!("artifact publication failed for '{pattern}': {err:#}"),
                    }
                }
            }
        }
        debug!(artifacts = published.len(), "Published artifacts");
        StageOutcome::Succeeded {
            attempts,
            steps,
            artifacts: published,
        }
    }
}
