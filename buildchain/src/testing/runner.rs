//! A step runner driven by per-stage scripts.

use crate::cancellation::CancellationToken;
use crate::errors::StepExecutionError;
use crate::interfaces::{StepOutcome, StepRequest, StepResult, StepRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Exit code reported for a step interrupted by cancellation.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// How the runner behaves for one stage.
#[derive(Debug, Clone, Default)]
pub struct StageScript {
    exit_codes: Vec<i32>,
    delay: Duration,
    failing_attempts: u32,
    error: Option<String>,
    gated: bool,
}

impl StageScript {
    /// Every step exits 0.
    #[must_use]
    pub fn succeed() -> Self {
        Self::default()
    }

    /// The first step exits with `code`.
    #[must_use]
    pub fn fail(code: i32) -> Self {
        Self::default().with_exit_codes([code])
    }

    /// The runner itself errors.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Exit codes by step index; missing entries exit 0.
    #[must_use]
    pub fn with_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.exit_codes = codes.into_iter().collect();
        self
    }

    /// Sleeps before reporting.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `attempts` attempts fail on their first step.
    #[must_use]
    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.failing_attempts = attempts;
        self
    }

    /// Each attempt blocks until [`ScriptedStepRunner::release`] is called.
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    fn exit_code(&self, step: usize, attempt: u32) -> i32 {
        if step == 0 && attempt <= self.failing_attempts {
            return 1;
        }
        self.exit_codes.get(step).copied().unwrap_or(0)
    }
}

/// One entry of the runner's journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// An attempt of the stage started.
    Started(String),
    /// An attempt of the stage returned.
    Finished(String),
    /// The stage was asked to abort.
    Cancelled(String),
}

#[derive(Debug, Default)]
struct Journal {
    events: Vec<RunnerEvent>,
    requests: Vec<StepRequest>,
}

/// A [`StepRunner`] that follows [`StageScript`]s and records what it did.
///
/// Stages without a script succeed immediately.
#[derive(Debug, Default)]
pub struct ScriptedStepRunner {
    scripts: Mutex<HashMap<String, StageScript>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    tokens: Mutex<HashMap<(Uuid, String), Arc<CancellationToken>>>,
    journal: Mutex<Journal>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedStepRunner {
    /// Creates a runner where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the script of a stage.
    #[must_use]
    pub fn with_script(self, stage_id: impl Into<String>, script: StageScript) -> Self {
        self.set_script(stage_id, script);
        self
    }

    /// Replaces the script of a stage.
    pub fn set_script(&self, stage_id: impl Into<String>, script: StageScript) {
        self.scripts.lock().insert(stage_id.into(), script);
    }

    /// Lets one waiting (or future) attempt of a gated stage proceed.
    pub fn release(&self, stage_id: &str) {
        self.gate(stage_id).add_permits(1);
    }

    fn gate(&self, stage_id: &str) -> Arc<Semaphore> {
        Arc::clone(
            self.gates
                .lock()
                .entry(stage_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    fn token(&self, run_id: Uuid, stage_id: &str) -> Arc<CancellationToken> {
        Arc::clone(
            self.tokens
                .lock()
                .entry((run_id, stage_id.to_string()))
                .or_default(),
        )
    }

    fn record(&self, event: RunnerEvent) {
        self.journal.lock().events.push(event);
    }

    /// Everything the runner did, in order.
    #[must_use]
    pub fn events(&self) -> Vec<RunnerEvent> {
        self.journal.lock().events.clone()
    }

    /// Stage ids in the order their attempts started.
    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunnerEvent::Started(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Stage ids whose execution was aborted.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunnerEvent::Cancelled(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Returns true if the stage started at least once.
    #[must_use]
    pub fn ran(&self, stage_id: &str) -> bool {
        self.started().iter().any(|s| s == stage_id)
    }

    /// Returns true if the last attempt of `first` returned before the
    /// first attempt of `second` started.
    #[must_use]
    pub fn finished_before_started(&self, first: &str, second: &str) -> bool {
        let events = self.events();
        let done = events
            .iter()
            .rposition(|e| *e == RunnerEvent::Finished(first.to_string()));
        let start = events
            .iter()
            .position(|e| *e == RunnerEvent::Started(second.to_string()));
        matches!((done, start), (Some(done), Some(start)) if done < start)
    }

    /// Every request received.
    #[must_use]
    pub fn requests(&self) -> Vec<StepRequest> {
        self.journal.lock().requests.clone()
    }

    /// Requests received for one stage.
    #[must_use]
    pub fn requests_for(&self, stage_id: &str) -> Vec<StepRequest> {
        self.journal
            .lock()
            .requests
            .iter()
            .filter(|r| r.stage_id == stage_id)
            .cloned()
            .collect()
    }

    /// Most attempts that were executing at the same time.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Waits until `stage_id` has started `count` attempts, or panics after
    /// `timeout`.
    pub async fn wait_started(&self, stage_id: &str, count: usize, timeout: Duration) {
        let poll = async {
            while self.started().iter().filter(|s| *s == stage_id).count() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        };
        assert!(
            tokio::time::timeout(timeout, poll).await.is_ok(),
            "stage '{stage_id}' did not start {count} time(s) within {timeout:?}"
        );
    }

    async fn wait_scripted(&self, script: &StageScript, stage_id: &str) {
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.gated {
            if let Ok(permit) = self.gate(stage_id).acquire_owned().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl StepRunner for ScriptedStepRunner {
    async fn run_steps(&self, request: &StepRequest) -> Result<StepResult, StepExecutionError> {
        let script = self
            .scripts
            .lock()
            .get(&request.stage_id)
            .cloned()
            .unwrap_or_default();
        let token = self.token(request.run_id, &request.stage_id);

        self.journal.lock().requests.push(request.clone());
        self.record(RunnerEvent::Started(request.stage_id.clone()));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let interrupted = tokio::select! {
            () = self.wait_scripted(&script, &request.stage_id) => false,
            () = token.cancelled() => true,
        };

        let result = if interrupted {
            let name = request
                .steps
                .first()
                .map_or_else(|| request.stage_id.clone(), |s| s.display_name().to_string());
            Ok(StepResult::new(vec![StepOutcome::new(name, CANCELLED_EXIT_CODE)
                .with_output("interrupted")]))
        } else if let Some(reason) = &script.error {
            Err(StepExecutionError::new(&request.stage_id, reason.clone()))
        } else {
            let mut outcomes = Vec::with_capacity(request.steps.len());
            for (i, step) in request.steps.iter().enumerate() {
                let code = script.exit_code(i, request.attempt);
                outcomes.push(
                    StepOutcome::new(step.display_name(), code).with_output(step.command.clone()),
                );
                if code != 0 && !step.continue_on_failure {
                    break;
                }
            }
            Ok(StepResult::new(outcomes))
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.record(RunnerEvent::Finished(request.stage_id.clone()));
        result
    }

    async fn cancel(&self, run_id: Uuid, stage_id: &str) {
        self.record(RunnerEvent::Cancelled(stage_id.to_string()));
        self.token(run_id, stage_id).cancel("aborted by scheduler");
    }
}
