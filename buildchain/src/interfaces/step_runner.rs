//! The Step Runner collaborator.

use crate::definition::StepSpec;
use crate::errors::StepExecutionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Everything the runner needs to execute one attempt of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequest {
    /// The run.
    pub run_id: Uuid,
    /// The stage.
    pub stage_id: String,
    /// Steps with parameter references already expanded.
    pub steps: Vec<StepSpec>,
    /// Environment: run parameters and upstream artifact locations.
    pub env: BTreeMap<String, String>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// Exit status and captured output of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step display name or command.
    pub name: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Captured output.
    #[serde(default)]
    pub output: String,
}

impl StepOutcome {
    /// Creates an outcome.
    #[must_use]
    pub fn new(name: impl Into<String>, exit_code: i32) -> Self {
        Self {
            name: name.into(),
            exit_code,
            output: String::new(),
        }
    }

    /// Attaches captured output.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Returns true for a zero exit code.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-step outcomes of one attempt, in step order.
///
/// A runner stops at the first failing step that may not be continued past,
/// so `steps` can be shorter than the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Outcomes of the steps that ran.
    pub steps: Vec<StepOutcome>,
}

impl StepResult {
    /// Creates a result from outcomes.
    #[must_use]
    pub fn new(steps: Vec<StepOutcome>) -> Self {
        Self { steps }
    }

    /// Decides whether the attempt succeeded for the given step specs.
    ///
    /// A failing step without `continue_on_failure` fails the stage. A
    /// failing continuable step is forgiven only if a later step succeeds.
    /// A result missing outcomes, with no failure to account for it, fails.
    ///
    /// # Errors
    ///
    /// Returns a description of why the attempt failed.
    pub fn evaluate(&self, specs: &[StepSpec]) -> Result<(), String> {
        let mut unrecovered: Option<&StepOutcome> = None;
        for (i, outcome) in self.steps.iter().enumerate() {
            let continuable = specs.get(i).is_some_and(|s| s.continue_on_failure);
            if outcome.succeeded() {
                unrecovered = None;
            } else if continuable {
                unrecovered.get_or_insert(outcome);
            } else {
                return Err(format!(
                    "step '{}' exited with code {}",
                    outcome.name, outcome.exit_code
                ));
            }
        }
        if let Some(outcome) = unrecovered {
            return Err(format!(
                "step '{}' exited with code {} and no later step succeeded",
                outcome.name, outcome.exit_code
            ));
        }
        if self.steps.len() < specs.len() {
            return Err(format!(
                "runner reported {} of {} steps",
                self.steps.len(),
                specs.len()
            ));
        }
        Ok(())
    }
}

/// Executes the opaque build steps of a stage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Runs the steps of one stage attempt.
    ///
    /// # Errors
    ///
    /// Returns `StepExecutionError` when the steps could not be executed at
    /// all, e.g. the environment could not be set up.
    async fn run_steps(&self, request: &StepRequest) -> Result<StepResult, StepExecutionError>;

    /// Requests abort of an in-flight execution. Must be idempotent.
    async fn cancel(&self, run_id: Uuid, stage_id: &str);
}
