//! The typed event payloads.

use crate::core::{RunStatus, StageStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something observable that happened in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A configuration was activated.
    GraphLoaded {
        /// Project id.
        project_id: String,
        /// Registry version of the new graph.
        version: u64,
        /// Number of stages.
        stages: usize,
    },
    /// A configuration was rejected; the previous graph stays active.
    GraphRejected {
        /// Diagnostic code, e.g. `LOAD-001-CYCLE`.
        code: String,
        /// Error message.
        message: String,
    },
    /// A run was instantiated.
    RunCreated {
        /// The run.
        run_id: Uuid,
        /// Triggering branch.
        branch: String,
        /// Triggering revision.
        revision: String,
        /// Number of stage instances.
        stages: usize,
    },
    /// A stage instance changed status.
    StageTransitioned {
        /// The run.
        run_id: Uuid,
        /// The stage.
        stage_id: String,
        /// Previous status.
        from: StageStatus,
        /// New status.
        to: StageStatus,
        /// Failure or cancellation detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A run reached its terminal status.
    RunCompleted {
        /// The run.
        run_id: Uuid,
        /// Terminal status.
        status: RunStatus,
    },
}

impl PipelineEvent {
    /// Dotted event type, e.g. `stage.failed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GraphLoaded { .. } => "graph.loaded",
            Self::GraphRejected { .. } => "graph.rejected",
            Self::RunCreated { .. } => "run.created",
            Self::RunCompleted { .. } => "run.completed",
            Self::StageTransitioned { to, .. } => match to {
                StageStatus::Pending => "stage.pending",
                StageStatus::Queued => "stage.queued",
                StageStatus::Running => "stage.started",
                StageStatus::Succeeded => "stage.succeeded",
                StageStatus::Failed => "stage.failed",
                StageStatus::Skipped => "stage.skipped",
                StageStatus::Cancelled => "stage.cancelled",
            },
        }
    }

    /// The run the event belongs to, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::StageTransitioned { run_id, .. }
            | Self::RunCompleted { run_id, .. } => Some(*run_id),
            Self::GraphLoaded { .. } | Self::GraphRejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        let event = PipelineEvent::StageTransitioned {
            run_id: Uuid::nil(),
            stage_id: "Build".to_string(),
            from: StageStatus::Queued,
            to: StageStatus::Running,
            detail: None,
        };
        assert_eq!(event.event_type(), "stage.started");
        assert_eq!(event.run_id(), Some(Uuid::nil()));

        let event = PipelineEvent::GraphRejected {
            code: "LOAD-001-CYCLE".to_string(),
            message: "cycle".to_string(),
        };
        assert_eq!(event.event_type(), "graph.rejected");
        assert_eq!(event.run_id(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::RunCompleted {
            run_id: Uuid::nil(),
            status: RunStatus::SucceededWithProblems,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run_completed");
        assert_eq!(json["status"], "succeeded_with_problems");
    }
}
