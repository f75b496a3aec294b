//! # Buildchain
//!
//! A CI pipeline orchestration engine.
//!
//! Buildchain turns a declarative pipeline configuration into a validated
//! stage graph and executes one run of that graph per triggering change:
//!
//! - **Stage Definition Registry**: loads configurations, rejects cycles and
//!   unknown references, and swaps the active graph atomically
//! - **Dependency Resolver**: topological order and upstream/downstream
//!   lookups over snapshot dependencies
//! - **Run Scheduler**: starts stages as their dependencies allow, applies
//!   per-edge failure policies and honours a global concurrency limit
//! - **Run State Store**: stage instances, the stage state machine and paged
//!   run listings
//!
//! Steps are opaque: a [`StepRunner`](interfaces::StepRunner) executes them,
//! an [`ArtifactStore`](interfaces::ArtifactStore) keeps published files and
//! a [`TriggerSource`](interfaces::TriggerSource) delivers change events.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use buildchain::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::from_env(), runner, artifacts);
//! engine.load_file("pipeline.json")?;
//!
//! if let Some(run) = engine.handle_change(ChangeEvent::new("app", "refs/heads/main", "a1b2c3"))? {
//!     let status = run.wait().await?;
//!     println!("run finished: {status}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod events;
pub mod interfaces;
pub mod observability;
pub mod pipeline;
pub mod run;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::core::{
        ArtifactRef, ChangeEvent, FailurePolicy, RunStatus, StageKind, StageStatus,
    };
    pub use crate::definition::{
        PipelineConfig, PipelineGraph, StageConfig, StageRegistry, StepSpec, TriggerConfig,
        VcsRoot,
    };
    pub use crate::engine::{Engine, EngineConfig, RunHandle, TriggerScope};
    pub use crate::errors::{BuildchainError, BuildchainResult, LoadError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::interfaces::{
        ArtifactStore, StepOutcome, StepRequest, StepResult, StepRunner, TriggerSource,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::run::{PageRequest, PageToken, Run, RunFilter, RunSummary, StageInstance};
    pub use crate::utils::{generate_uuid_v7, iso_timestamp, Timestamp};
}
