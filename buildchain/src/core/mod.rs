//! Core domain model types.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status, stage kind, failure policy and run status enums
//! - Artifact references
//! - Change events

mod artifact;
mod event;
mod status;

pub use artifact::ArtifactRef;
pub use event::{full_branch_ref, short_branch_name, ChangeEvent};
pub use status::{EdgeVerdict, FailurePolicy, RunStatus, StageKind, StageStatus};
