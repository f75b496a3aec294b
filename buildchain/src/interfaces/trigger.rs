//! The Trigger Source collaborator.

use crate::core::ChangeEvent;
use futures::stream::BoxStream;

/// Emits change events that may start runs.
pub trait TriggerSource: Send + Sync {
    /// Subscribes to change events. The stream ends when the source closes.
    fn subscribe(&self) -> BoxStream<'static, ChangeEvent>;
}
