//! Pipeline events and the sinks that receive them.
//!
//! Every graph load, run creation, stage transition and run completion is
//! published as a [`PipelineEvent`] to the engine's [`EventSink`], next to
//! the `tracing` records written at the same point.

mod event;
mod sink;

pub use event::PipelineEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
