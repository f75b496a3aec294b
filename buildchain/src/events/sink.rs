//! Event sink trait and implementations.

use super::PipelineEvent;
use crate::core::StageStatus;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};
use uuid::Uuid;

/// Receives pipeline events.
///
/// Sinks must never fail the caller: errors are logged and suppressed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &PipelineEvent);

    /// Emits an event without blocking.
    ///
    /// The scheduler calls this while holding a run's lock.
    fn try_emit(&self, event: &PipelineEvent);
}

/// Discards all events. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {}

    fn try_emit(&self, _event: &PipelineEvent) {}
}

/// Writes events as `tracing` records.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink writing at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &PipelineEvent) {
        let event_type = event.event_type();
        let run_id = event.run_id().map(|id| id.to_string()).unwrap_or_default();
        match event {
            PipelineEvent::GraphRejected { code, message } => {
                warn!(event_type, code = %code, "{}", message);
            }
            PipelineEvent::StageTransitioned {
                stage_id,
                from,
                to,
                detail,
                ..
            } => {
                if self.level == Level::DEBUG {
                    debug!(event_type, run_id = %run_id, stage = %stage_id, from = %from, to = %to, detail = ?detail, "Event: {}", event_type);
                } else {
                    info!(event_type, run_id = %run_id, stage = %stage_id, from = %from, to = %to, detail = ?detail, "Event: {}", event_type);
                }
            }
            _ => {
                if self.level == Level::DEBUG {
                    debug!(event_type, run_id = %run_id, event_data = ?event, "Event: {}", event_type);
                } else {
                    info!(event_type, run_id = %run_id, event_data = ?event, "Event: {}", event_type);
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Statuses a stage moved through in a run, in emission order.
    #[must_use]
    pub fn transitions_of(&self, run_id: Uuid, stage: &str) -> Vec<StageStatus> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageTransitioned {
                    run_id: id,
                    stage_id,
                    to,
                    ..
                } if *id == run_id && stage_id == stage => Some(*to),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunStatus;

    fn transition(stage: &str, from: StageStatus, to: StageStatus) -> PipelineEvent {
        PipelineEvent::StageTransitioned {
            run_id: Uuid::nil(),
            stage_id: stage.to_string(),
            from,
            to,
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let event = transition("Build", StageStatus::Pending, StageStatus::Queued);
        NoOpEventSink.emit(&event).await;
        NoOpEventSink.try_emit(&event);

        let sink = LoggingEventSink::debug();
        sink.emit(&event).await;
        sink.try_emit(&PipelineEvent::GraphRejected {
            code: "LOAD-007-PARSE".to_string(),
            message: "bad json".to_string(),
        });
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&transition("Build", StageStatus::Pending, StageStatus::Queued))
            .await;
        sink.try_emit(&transition("Build", StageStatus::Queued, StageStatus::Running));
        sink.try_emit(&transition("Test", StageStatus::Pending, StageStatus::Cancelled));
        sink.try_emit(&PipelineEvent::RunCompleted {
            run_id: Uuid::nil(),
            status: RunStatus::Failed,
        });

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.events_of_type("stage.").len(), 3);
        assert_eq!(sink.events_of_type("run.completed").len(), 1);
        assert_eq!(
            sink.transitions_of(Uuid::nil(), "Build"),
            vec![StageStatus::Queued, StageStatus::Running]
        );

        sink.clear();
        assert!(sink.is_empty());
    }
}
