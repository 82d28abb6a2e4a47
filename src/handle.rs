use crate::error::PoolError;
use crate::state::{CancelOutcome, TaskCell, TaskStatus};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// A handle to a task submitted to a `WorkerPool`.
///
/// Returned immediately by `submit`. The handle can be polled (`is_done`, `status`), awaited
/// (`get`, `get_timeout`), waited on from a plain thread (`get_blocking`), or cancelled.
/// Clones observe the same task. Dropping every handle does not stop the task.
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) cell: Arc<TaskCell<R>>,
}

impl<R: Send + 'static> Clone for TaskHandle<R> {
  fn clone(&self) -> Self {
    Self {
      task_id: self.task_id,
      cell: self.cell.clone(),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for TaskHandle<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("task_id", &self.task_id)
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Snapshot of the task's current state. Never blocks on the task.
  pub fn status(&self) -> TaskStatus {
    self.cell.status()
  }

  /// True once the task completed, failed or was cancelled.
  pub fn is_done(&self) -> bool {
    self.status().is_terminal()
  }

  pub fn is_cancelled(&self) -> bool {
    self.status() == TaskStatus::Cancelled
  }

  /// True if an interrupt was requested for the running task, whether or not it took effect.
  pub fn is_interrupt_requested(&self) -> bool {
    self.cell.is_interrupt_requested()
  }

  /// Attempts to cancel the task.
  ///
  /// - Already finished: returns `false` and nothing changes.
  /// - Still queued: the task becomes `Cancelled` immediately and will never run.
  /// - Running: with `may_interrupt_if_running` set and an async computation, an interrupt is
  ///   requested and `true` is returned. The interrupt lands at the computation's next `.await`;
  ///   a computation that finishes without reaching one still ends `Completed`.
  ///   Blocking computations cannot be interrupted, so this returns `false` for them.
  pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
    let outcome = self.cell.cancel(may_interrupt_if_running);
    debug!(task_id = %self.task_id, may_interrupt_if_running, ?outcome, "TaskHandle: Cancellation requested.");
    outcome != CancelOutcome::Refused
  }
}

impl<R: Clone + Send + 'static> TaskHandle<R> {
  /// Waits for the task to finish and returns its result.
  ///
  /// Can be called any number of times; every call yields the same outcome.
  ///
  /// # Errors
  /// Returns `PoolError::TaskFailed` if the computation returned an error.
  /// Returns `PoolError::TaskPanicked` if the computation panicked.
  /// Returns `PoolError::TaskCancelled` if the task was cancelled or discarded by shutdown.
  pub async fn get(&self) -> Result<R, PoolError> {
    self.cell.wait().await
  }

  /// Like [`get`](Self::get), but gives up after `timeout` with `PoolError::Timeout`.
  /// The task itself keeps running.
  pub async fn get_timeout(&self, timeout: Duration) -> Result<R, PoolError> {
    match tokio::time::timeout(timeout, self.cell.wait()).await {
      Ok(outcome) => outcome,
      Err(_elapsed) => {
        debug!(task_id = %self.task_id, ?timeout, "TaskHandle: Timed out waiting for result.");
        Err(PoolError::Timeout(timeout))
      }
    }
  }

  /// Blocks the current thread until the task finishes.
  ///
  /// Intended for callers outside the async runtime; calling this from an async task stalls the
  /// runtime worker it runs on.
  pub fn get_blocking(&self) -> Result<R, PoolError> {
    self.cell.wait_blocking(None)
  }

  /// Blocking variant of [`get_timeout`](Self::get_timeout).
  pub fn get_blocking_timeout(&self, timeout: Duration) -> Result<R, PoolError> {
    self.cell.wait_blocking(Some(timeout))
  }

  /// Returns the outcome if the task has finished, without waiting.
  pub fn try_get(&self) -> Option<Result<R, PoolError>> {
    self.cell.try_outcome()
  }
}
