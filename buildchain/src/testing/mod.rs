//! Testing utilities for buildchain pipelines.
//!
//! This module provides:
//! - A scripted step runner, an in-memory artifact store and a channel
//!   trigger source
//! - Ready-made pipeline configurations and an engine harness
//! - Assertions over runs and emitted events

mod artifacts;
mod assertions;
mod fixtures;
mod runner;
mod trigger;

pub use artifacts::InMemoryArtifactStore;
pub use assertions::{
    assert_finished_before_started, assert_run_status, assert_stage_status,
    assert_stage_statuses, assert_valid_history,
};
pub use fixtures::{fast_config, push, release_config, scenario_config, TestEngine, REPOSITORY};
pub use runner::{RunnerEvent, ScriptedStepRunner, StageScript, CANCELLED_EXIT_CODE};
pub use trigger::ChannelTriggerSource;
