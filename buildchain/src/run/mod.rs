//! Runs: planning, state, scheduling and queries.
//!
//! - [`plan`] decides which stages an event instantiates and skips
//! - [`RunStateStore`] holds every run's instances and enforces the stage
//!   state machine
//! - [`RunScheduler`] drives one run's event loop
//! - [`RunFilter`], [`PageToken`] and [`RunPages`] serve listings

mod instance;
mod params;
mod plan;
mod query;
mod scheduler;
mod store;


pub use instance::{
    CancelCause, Run, RunSummary, StageInstance, TransitionDetails, TransitionRecord,
};
pub use params::{expand, expand_steps};
pub use plan::{plan, RunPlan, TriggerScope};
pub use query::{PageRequest, PageToken, RunFilter, RunPage, RunPages};
pub use scheduler::{RunScheduler, SchedulerContext, SchedulerMessage, StageOutcome};
pub use store::{RunStateStore, Transitioned};
