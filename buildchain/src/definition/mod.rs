//! Stage Definition Registry.
//!
//! Raw configuration records ([`PipelineConfig`]) are validated and compiled
//! into an immutable [`PipelineGraph`]; the [`StageRegistry`] keeps the
//! active graph and swaps it atomically on each successful load.

mod config;
mod filter;
mod graph;
mod registry;
mod spec;

pub use config::{PipelineConfig, PollingMode, StageConfig, TriggerConfig, VcsRoot};
pub use filter::{BranchFilter, DEFAULT_BRANCH_PLACEHOLDER};
pub(crate) use filter::wildcard_regex;
pub use graph::PipelineGraph;
pub use registry::StageRegistry;
pub use spec::{DependencyEdge, StageDefinition, StageTrigger, StepSpec};
