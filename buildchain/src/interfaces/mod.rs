//! Narrow interfaces to the engine's external collaborators.
//!
//! The engine never executes commands, stores bytes or talks to a VCS
//! itself; it drives these traits. In-memory implementations live in
//! [`crate::testing`].

mod artifact_store;
mod step_runner;
mod trigger;

pub use artifact_store::{ArtifactReader, ArtifactStore};
pub use step_runner::{StepOutcome, StepRequest, StepResult, StepRunner};
pub use trigger::TriggerSource;

#[cfg(test)]
pub use artifact_store::MockArtifactStore;
#[cfg(test)]
pub use step_runner::MockStepRunner;
