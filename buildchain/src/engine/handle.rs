//! Handles to in-flight runs.

use crate::cancellation::CancellationToken;
use crate::core::RunStatus;
use crate::errors::{BuildchainError, BuildchainResult};
use crate::run::{Run, RunStateStore, SchedulerMessage};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The cancellation side of a run, shared by its handle and the engine.
#[derive(Clone)]
pub(crate) struct RunControl {
    tx: UnboundedSender<SchedulerMessage>,
    token: Arc<CancellationToken>,
}

impl RunControl {
    pub(crate) fn new(tx: UnboundedSender<SchedulerMessage>) -> Self {
        Self {
            tx,
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Requests run cancellation once; later calls are no-ops.
    pub(crate) fn cancel(&self, reason: &str) -> bool {
        if !self.token.cancel(reason) {
            return false;
        }
        // the scheduler is gone once the run finished; nothing to cancel then
        self.tx
            .send(SchedulerMessage::CancelRun {
                reason: reason.to_string(),
            })
            .is_ok()
    }

    pub(crate) fn cancel_stage(&self, stage_id: &str, reason: &str) {
        let _ = self.tx.send(SchedulerMessage::CancelStage {
            stage_id: stage_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// A started run.
pub struct RunHandle {
    run_id: Uuid,
    control: RunControl,
    store: Arc<RunStateStore>,
    join: JoinHandle<RunStatus>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: Uuid,
        control: RunControl,
        store: Arc<RunStateStore>,
        join: JoinHandle<RunStatus>,
    ) -> Self {
        Self {
            run_id,
            control,
            store,
            join,
        }
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Cancels the run.
    ///
    /// Idempotent: returns false if the run was already cancelled or has
    /// finished, in which case nothing changes.
    pub fn cancel(&self, reason: &str) -> bool {
        self.control.cancel(reason)
    }

    /// Cancels one stage of the run and, through the failure policies,
    /// its dependents. A terminal stage is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the stage is not part of the run.
    pub fn cancel_stage(&self, stage_id: &str, reason: &str) -> BuildchainResult<()> {
        self.store.get_instance(self.run_id, stage_id)?;
        self.control.cancel_stage(stage_id, reason);
        Ok(())
    }

    /// A snapshot of the run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run was archived.
    pub fn snapshot(&self) -> BuildchainResult<Run> {
        self.store.get_run(self.run_id)
    }

    /// Returns true once the scheduler has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the run to reach its terminal status.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the scheduler task panicked.
    pub async fn wait(self) -> BuildchainResult<RunStatus> {
        self.join
            .await
            .map_err(|e| BuildchainError::Internal(format!("scheduler task failed: {e}")))
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("finished", &self.join.is_finished())
            .finish_non_exhaustive()
    }
}
