//! Per-run mutable state: [`Run`] and its [`StageInstance`] records.

use crate::core::{ArtifactRef, ChangeEvent, RunStatus, StageKind, StageStatus};
use crate::errors::DependencyViolationError;
use crate::interfaces::StepOutcome;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One entry of an instance's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Status entered.
    pub status: StageStatus,
    /// When it was entered.
    pub at: Timestamp,
}

/// Why an instance was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum CancelCause {
    /// An operator cancelled the run or the stage.
    Requested {
        /// Reason given with the request.
        reason: String,
    },
    /// A `FAIL_TO_START` upstream did not succeed.
    Dependency(DependencyViolationError),
}

/// Optional data recorded together with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub(crate) detail: Option<String>,
    pub(crate) step_results: Option<Vec<StepOutcome>>,
    pub(crate) artifacts: Vec<ArtifactRef>,
    pub(crate) attempts: Option<u32>,
    pub(crate) cancel_cause: Option<CancelCause>,
}

impl TransitionDetails {
    /// No details.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the human-readable detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the step outcomes of the last attempt.
    #[must_use]
    pub fn with_step_results(mut self, results: Vec<StepOutcome>) -> Self {
        self.step_results = Some(results);
        self
    }

    /// Sets the published artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactRef>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Sets the number of attempts made.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the cancellation cause; also used as detail if none is set.
    #[must_use]
    pub fn with_cancel_cause(mut self, cause: CancelCause) -> Self {
        if self.detail.is_none() {
            self.detail = Some(match &cause {
                CancelCause::Requested { reason } => reason.clone(),
                CancelCause::Dependency(violation) => violation.to_string(),
            });
        }
        self.cancel_cause = Some(cause);
        self
    }
}

/// The mutable state of one stage within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInstance {
    /// The stage.
    pub stage_id: String,
    /// Stage kind, copied from the definition.
    pub kind: StageKind,
    /// Current status.
    pub status: StageStatus,
    /// Whether the stage's own trigger started the run.
    pub triggered: bool,
    /// Every dependent in the run reaches this stage over an `ADD_PROBLEM`
    /// or `IGNORE` edge, so its failure degrades the run instead of failing it.
    #[serde(default)]
    pub failure_tolerated: bool,
    /// When the instance entered `running` (or `queued`, for composites).
    pub started_at: Option<Timestamp>,
    /// When the instance reached a terminal status.
    pub finished_at: Option<Timestamp>,
    /// Attempts made by the step runner.
    pub attempts: u32,
    /// Step outcomes of the last attempt.
    pub step_results: Vec<StepOutcome>,
    /// Artifacts published on success.
    pub artifacts: Vec<ArtifactRef>,
    /// Failure or cancellation detail.
    pub detail: Option<String>,
    /// Set when cancelled.
    pub cancel_cause: Option<CancelCause>,
    /// Every status entered, starting with `pending`.
    pub history: Vec<TransitionRecord>,
}

impl StageInstance {
    pub(crate) fn new(stage_id: impl Into<String>, kind: StageKind, triggered: bool, at: Timestamp) -> Self {
        Self {
            stage_id: stage_id.into(),
            kind,
            status: StageStatus::Pending,
            triggered,
            failure_tolerated: false,
            started_at: None,
            finished_at: None,
            attempts: 0,
            step_results: Vec::new(),
            artifacts: Vec::new(),
            detail: None,
            cancel_cause: None,
            history: vec![TransitionRecord {
                status: StageStatus::Pending,
                at,
            }],
        }
    }

    /// Applies a transition already checked against the state machine.
    pub(crate) fn apply(&mut self, to: StageStatus, details: TransitionDetails, at: Timestamp) {
        self.status = to;
        self.history.push(TransitionRecord { status: to, at });

        let starts = match self.kind {
            StageKind::Normal => to == StageStatus::Running,
            StageKind::Composite => to == StageStatus::Queued,
        };
        if starts {
            self.started_at = Some(at);
        }
        if to.is_terminal() {
            self.finished_at = Some(at);
        }

        if details.detail.is_some() {
            self.detail = details.detail;
        }
        if let Some(results) = details.step_results {
            self.step_results = results;
        }
        if !details.artifacts.is_empty() {
            self.artifacts = details.artifacts;
        }
        if let Some(attempts) = details.attempts {
            self.attempts = attempts;
        }
        if details.cancel_cause.is_some() {
            self.cancel_cause = details.cancel_cause;
        }
    }

    /// The sequence of statuses entered.
    #[must_use]
    pub fn status_path(&self) -> Vec<StageStatus> {
        self.history.iter().map(|r| r.status).collect()
    }

    /// Duration between start and finish, in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(crate::utils::duration_ms(&start, &end)),
            _ => None,
        }
    }
}

/// One instantiation of the pipeline graph for one change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Run id (UUIDv7, time-ordered).
    pub id: Uuid,
    /// Store-assigned creation sequence; the paging cursor.
    pub sequence: u64,
    /// Project of the graph the run was created from.
    pub project_id: String,
    /// Version of that graph.
    pub graph_version: u64,
    /// The triggering change.
    pub trigger: ChangeEvent,
    /// Creation time.
    pub created_at: Timestamp,
    /// When every instance became terminal.
    pub finished_at: Option<Timestamp>,
    /// Overall status.
    pub status: RunStatus,
    /// Stage instances by stage id.
    pub instances: BTreeMap<String, StageInstance>,
    /// `ADD_PROBLEM` violations; the run is degraded if any.
    pub problems: Vec<DependencyViolationError>,
    /// `FAIL_TO_START` violations; the run fails if any.
    pub violations: Vec<DependencyViolationError>,
    /// Reason of an explicit run cancellation.
    pub cancel_reason: Option<String>,
}

impl Run {
    /// Looks up a stage instance.
    #[must_use]
    pub fn instance(&self, stage_id: &str) -> Option<&StageInstance> {
        self.instances.get(stage_id)
    }

    /// Status of a stage instance.
    #[must_use]
    pub fn stage_status(&self, stage_id: &str) -> Option<StageStatus> {
        self.instances.get(stage_id).map(|i| i.status)
    }

    /// Returns true when every instance is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.instances.values().all(|i| i.status.is_terminal())
    }

    /// Number of instances currently `running`.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.status == StageStatus::Running)
            .count()
    }

    /// Derives the overall status from the instances.
    ///
    /// `Failed` wins over `Cancelled`, which wins over problems. A failed
    /// stage whose failure every dependent tolerates only degrades the run.
    #[must_use]
    pub fn compute_status(&self) -> RunStatus {
        if !self.all_terminal() {
            return RunStatus::Running;
        }
        let failed = || {
            self.instances
                .values()
                .filter(|i| i.status == StageStatus::Failed)
        };
        if failed().any(|i| !i.failure_tolerated) || !self.violations.is_empty() {
            RunStatus::Failed
        } else if self
            .instances
            .values()
            .any(|i| i.status == StageStatus::Cancelled)
        {
            RunStatus::Cancelled
        } else if !self.problems.is_empty() || failed().next().is_some() {
            RunStatus::SucceededWithProblems
        } else {
            RunStatus::Succeeded
        }
    }

    /// A compact summary for listings.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let count = |status: StageStatus| {
            self.instances
                .values()
                .filter(|i| i.status == status)
                .count()
        };
        RunSummary {
            id: self.id,
            project_id: self.project_id.clone(),
            branch: self.trigger.branch.clone(),
            revision: self.trigger.revision.clone(),
            status: self.status,
            created_at: self.created_at,
            finished_at: self.finished_at,
            stages: self.instances.len(),
            succeeded: count(StageStatus::Succeeded),
            failed: count(StageStatus::Failed),
            problems: self.problems.len(),
        }
    }
}

/// Listing view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run id.
    pub id: Uuid,
    /// Project id.
    pub project_id: String,
    /// Triggering branch.
    pub branch: String,
    /// Triggering revision.
    pub revision: String,
    /// Overall status.
    pub status: RunStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// Completion time.
    pub finished_at: Option<Timestamp>,
    /// Number of stage instances.
    pub stages: usize,
    /// Succeeded instances.
    pub succeeded: usize,
    /// Failed instances.
    pub failed: usize,
    /// `ADD_PROBLEM` violations.
    pub problems: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    fn run_with(statuses: &[(&str, StageStatus)]) -> Run {
        let now = now_utc();
        let instances = statuses
            .iter()
            .map(|(id, status)| {
                let mut instance = StageInstance::new(*id, StageKind::Normal, true, now);
                instance.status = *status;
                ((*id).to_string(), instance)
            })
            .collect();
        Run {
            id: Uuid::nil(),
            sequence: 1,
            project_id: "ci".to_string(),
            graph_version: 1,
            trigger: ChangeEvent::new("repo", "main", "abc"),
            created_at: now,
            finished_at: None,
            status: RunStatus::Running,
            instances,
            problems: Vec::new(),
            violations: Vec::new(),
            cancel_reason: None,
        }
    }

    fn violation(stage: &str, upstream: &str) -> DependencyViolationError {
        DependencyViolationError {
            stage_id: stage.to_string(),
            upstream: upstream.to_string(),
            upstream_status: StageStatus::Failed,
        }
    }

    #[test]
    fn test_status_precedence() {
        let run = run_with(&[("a", StageStatus::Succeeded), ("b", StageStatus::Running)]);
        assert_eq!(run.compute_status(), RunStatus::Running);

        let mut run = run_with(&[("a", StageStatus::Succeeded), ("b", StageStatus::Skipped)]);
        assert_eq!(run.compute_status(), RunStatus::Succeeded);

        run.problems.push(violation("b", "a"));
        assert_eq!(run.compute_status(), RunStatus::SucceededWithProblems);

        let mut run = run_with(&[("a", StageStatus::Cancelled), ("b", StageStatus::Succeeded)]);
        run.problems.push(violation("b", "a"));
        assert_eq!(run.compute_status(), RunStatus::Cancelled);

        run.violations.push(violation("c", "a"));
        assert_eq!(run.compute_status(), RunStatus::Failed);

        let run = run_with(&[("a", StageStatus::Failed), ("b", StageStatus::Cancelled)]);
        assert_eq!(run.compute_status(), RunStatus::Failed);
    }

    #[test]
    fn test_tolerated_failure_degrades_run() {
        let mut run = run_with(&[("Lint", StageStatus::Failed), ("Package", StageStatus::Succeeded)]);
        assert_eq!(run.compute_status(), RunStatus::Failed);

        if let Some(lint) = run.instances.get_mut("Lint") {
            lint.failure_tolerated = true;
        }
        assert_eq!(run.compute_status(), RunStatus::SucceededWithProblems);
    }

    #[test]
    fn test_apply_records_history_and_timestamps() {
        let now = now_utc();
        let mut instance = StageInstance::new("Build", StageKind::Normal, true, now);
        instance.apply(StageStatus::Queued, TransitionDetails::none(), now);
        assert!(instance.started_at.is_none());

        instance.apply(StageStatus::Running, TransitionDetails::none(), now);
        instance.apply(
            StageStatus::Failed,
            TransitionDetails::none()
                .with_detail("step 'make' exited with code 2")
                .with_attempts(2)
                .with_step_results(vec![StepOutcome::new("make", 2)]),
            now,
        );

        assert_eq!(
            instance.status_path(),
            vec![
                StageStatus::Pending,
                StageStatus::Queued,
                StageStatus::Running,
                StageStatus::Failed
            ]
        );
        assert_eq!(instance.attempts, 2);
        assert_eq!(instance.step_results.len(), 1);
        assert_eq!(instance.duration_ms(), Some(0));
    }

    #[test]
    fn test_cancel_cause_sets_detail() {
        let details = TransitionDetails::none().with_cancel_cause(CancelCause::Requested {
            reason: "superseded".to_string(),
        });
        assert_eq!(details.detail.as_deref(), Some("superseded"));
    }

    #[test]
    fn test_summary_counts() {
        let mut run = run_with(&[
            ("a", StageStatus::Succeeded),
            ("b", StageStatus::Failed),
            ("c", StageStatus::Cancelled),
        ]);
        run.status = run.compute_status();
        let summary = run.summary();
        assert_eq!(summary.stages, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.branch, "main");
    }
}
