//! Stage status, stage kind, failure policy and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a stage runs steps of its own or only aggregates its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A stage that runs its steps through the step runner.
    #[default]
    Normal,
    /// A stage with no steps whose outcome is derived from its dependencies.
    Composite,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Composite => write!(f, "composite"),
        }
    }
}

/// Per-edge rule for how an upstream failure affects the downstream stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// The upstream must succeed, otherwise the downstream is cancelled.
    #[default]
    FailToStart,
    /// The downstream still runs, but the run is flagged as degraded.
    AddProblem,
    /// The upstream outcome is irrelevant.
    Ignore,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailToStart => write!(f, "FAIL_TO_START"),
            Self::AddProblem => write!(f, "ADD_PROBLEM"),
            Self::Ignore => write!(f, "IGNORE"),
        }
    }
}

/// How a terminal upstream status is judged against an edge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeVerdict {
    /// The upstream outcome allows the downstream to proceed cleanly.
    Satisfied,
    /// The downstream may proceed, but a problem must be recorded.
    Degraded,
    /// The downstream must not start.
    Violated,
    /// The upstream has not finished yet.
    Waiting,
}

impl FailurePolicy {
    /// Judges an upstream status against this policy.
    ///
    /// Skipped upstreams never block: they are not part of the run's work.
    #[must_use]
    pub fn evaluate(self, upstream: StageStatus) -> EdgeVerdict {
        if !upstream.is_terminal() {
            return EdgeVerdict::Waiting;
        }
        if matches!(upstream, StageStatus::Succeeded | StageStatus::Skipped) {
            return EdgeVerdict::Satisfied;
        }
        match self {
            Self::FailToStart => EdgeVerdict::Violated,
            Self::AddProblem => EdgeVerdict::Degraded,
            Self::Ignore => EdgeVerdict::Satisfied,
        }
    }
}

/// The status of one stage instance within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Created, waiting for upstream stages.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a concurrency slot.
    Queued,
    /// Steps are executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failure.
    Failed,
    /// Excluded from the run by its trigger filter.
    Skipped,
    /// Cancelled explicitly or by an upstream failure.
    Cancelled,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Returns true if a stage of `kind` may move from this status to `next`
    /// in one step.
    ///
    /// Normal stages only finish from `running`. Composite stages never run
    /// and resolve straight from `queued`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self, kind: StageKind) -> bool {
        use StageStatus::{Cancelled, Failed, Pending, Queued, Running, Skipped, Succeeded};
        match (self, kind) {
            (Pending, _) => matches!(next, Queued | Skipped | Cancelled),
            (Queued, StageKind::Normal) => matches!(next, Running | Cancelled),
            (Queued, StageKind::Composite) => matches!(next, Succeeded | Failed | Cancelled),
            (Running, StageKind::Normal) => matches!(next, Succeeded | Failed | Cancelled),
            _ => false,
        }
    }
}

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one stage instance is not terminal.
    #[default]
    Running,
    /// Every stage finished and nothing went wrong.
    Succeeded,
    /// Finished without hard failures but with `ADD_PROBLEM` violations.
    SucceededWithProblems,
    /// A stage failed or a `FAIL_TO_START` dependency was violated.
    Failed,
    /// The run was cancelled before it could finish.
    Cancelled,
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns true for both clean and degraded success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededWithProblems)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::SucceededWithProblems => write!(f, "succeeded with problems"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Pending.to_string(), "pending");
        assert_eq!(StageStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(StageStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Cancelled.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Queued.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use StageKind::Normal;
        assert!(StageStatus::Pending.can_transition_to(StageStatus::Queued, Normal));
        assert!(StageStatus::Pending.can_transition_to(StageStatus::Skipped, Normal));
        assert!(StageStatus::Queued.can_transition_to(StageStatus::Running, Normal));
        assert!(StageStatus::Running.can_transition_to(StageStatus::Succeeded, Normal));
        assert!(StageStatus::Running.can_transition_to(StageStatus::Cancelled, Normal));

        assert!(!StageStatus::Running.can_transition_to(StageStatus::Queued, Normal));
        assert!(!StageStatus::Pending.can_transition_to(StageStatus::Running, Normal));
        assert!(!StageStatus::Succeeded.can_transition_to(StageStatus::Failed, Normal));
        assert!(!StageStatus::Skipped.can_transition_to(StageStatus::Queued, Normal));
        assert!(!StageStatus::Cancelled.can_transition_to(StageStatus::Cancelled, Normal));
    }

    #[test]
    fn test_transitions_depend_on_kind() {
        use StageKind::{Composite, Normal};
        assert!(!StageStatus::Queued.can_transition_to(StageStatus::Succeeded, Normal));
        assert!(!StageStatus::Queued.can_transition_to(StageStatus::Failed, Normal));
        assert!(StageStatus::Queued.can_transition_to(StageStatus::Cancelled, Normal));

        assert!(StageStatus::Queued.can_transition_to(StageStatus::Succeeded, Composite));
        assert!(StageStatus::Queued.can_transition_to(StageStatus::Failed, Composite));
        assert!(StageStatus::Queued.can_transition_to(StageStatus::Cancelled, Composite));
        assert!(!StageStatus::Queued.can_transition_to(StageStatus::Running, Composite));
        assert!(!StageStatus::Running.can_transition_to(StageStatus::Succeeded, Composite));
    }

    #[test]
    fn test_policy_evaluation() {
        use EdgeVerdict::*;
        let fts = FailurePolicy::FailToStart;
        assert_eq!(fts.evaluate(StageStatus::Running), Waiting);
        assert_eq!(fts.evaluate(StageStatus::Succeeded), Satisfied);
        assert_eq!(fts.evaluate(StageStatus::Skipped), Satisfied);
        assert_eq!(fts.evaluate(StageStatus::Failed), Violated);
        assert_eq!(fts.evaluate(StageStatus::Cancelled), Violated);

        assert_eq!(FailurePolicy::AddProblem.evaluate(StageStatus::Failed), Degraded);
        assert_eq!(FailurePolicy::Ignore.evaluate(StageStatus::Failed), Satisfied);
    }

    #[test]
    fn test_failure_policy_serialize() {
        let json = serde_json::to_string(&FailurePolicy::FailToStart).unwrap();
        assert_eq!(json, r#""FAIL_TO_START""#);

        let policy: FailurePolicy = serde_json::from_str(r#""ADD_PROBLEM""#).unwrap();
        assert_eq!(policy, FailurePolicy::AddProblem);
    }

    #[test]
    fn test_run_status() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::SucceededWithProblems.is_success());
        assert!(!RunStatus::Failed.is_success());
        assert_eq!(RunStatus::SucceededWithProblems.to_string(), "succeeded with problems");
    }
}
