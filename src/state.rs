use crate::error::PoolError;

use std::pin::pin;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Observable lifecycle state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
  /// Queued, not yet picked up by the dispatcher.
  Pending,
  /// Executing on one of the pool's slots.
  Running,
  /// Finished and produced a value.
  Completed,
  /// Finished with an error or a panic.
  Failed,
  /// Cancelled before it ran, interrupted while running, or discarded by shutdown.
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
  }
}

#[derive(Debug)]
enum TaskState<R> {
  Pending,
  Running,
  Completed(R),
  Failed(PoolError),
  Cancelled,
}

impl<R> TaskState<R> {
  fn status(&self) -> TaskStatus {
    match self {
      TaskState::Pending => TaskStatus::Pending,
      TaskState::Running => TaskStatus::Running,
      TaskState::Completed(_) => TaskStatus::Completed,
      TaskState::Failed(_) => TaskStatus::Failed,
      TaskState::Cancelled => TaskStatus::Cancelled,
    }
  }
}

impl<R: Clone> TaskState<R> {
  fn outcome(&self) -> Option<Result<R, PoolError>> {
    match self {
      TaskState::Pending | TaskState::Running => None,
      TaskState::Completed(value) => Some(Ok(value.clone())),
      TaskState::Failed(err) => Some(Err(err.clone())),
      TaskState::Cancelled => Some(Err(PoolError::TaskCancelled)),
    }
  }
}

/// Result of a `cancel` request against the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
  /// Pending task moved straight to `Cancelled`.
  Cancelled,
  /// Running task was asked to stop at its next interruption point.
  InterruptRequested,
  /// Nothing changed.
  Refused,
}

/// Shared state of one task. The pool's execution path and `TaskHandle` hold it through an `Arc`.
///
/// Every transition happens under `state`'s lock, so completion and cancellation cannot both be
/// observed. Async waiters park on `notify`, thread waiters on `settled`.
#[derive(Debug)]
pub(crate) struct TaskCell<R> {
  state: Mutex<TaskState<R>>,
  settled: Condvar,
  notify: Notify,
  interrupt: CancellationToken,
  interruptible: bool,
}

impl<R> TaskCell<R> {
  pub(crate) fn new(interruptible: bool) -> Self {
    Self {
      state: Mutex::new(TaskState::Pending),
      settled: Condvar::new(),
      notify: Notify::new(),
      interrupt: CancellationToken::new(),
      interruptible,
    }
  }

  pub(crate) fn status(&self) -> TaskStatus {
    self.state.lock().status()
  }

  /// Token the executing slot selects on. Cancelled when an interrupt is requested.
  pub(crate) fn interrupt_token(&self) -> &CancellationToken {
    &self.interrupt
  }

  pub(crate) fn is_interrupt_requested(&self) -> bool {
    self.interrupt.is_cancelled()
  }

  /// `Pending -> Running`. Returns false if the task was cancelled while queued.
  pub(crate) fn start(&self) -> bool {
    let mut state = self.state.lock();
    match *state {
      TaskState::Pending => {
        *state = TaskState::Running;
        true
      }
      _ => false,
    }
  }

  /// Records the execution outcome of a running task. `Err(TaskCancelled)` becomes `Cancelled`.
  /// Returns the status actually stored.
  pub(crate) fn settle(&self, outcome: Result<R, PoolError>) -> TaskStatus {
    let status = {
      let mut state = self.state.lock();
      if !matches!(*state, TaskState::Running) {
        trace!(current = ?state.status(), "settle ignored, task is not running");
        return state.status();
      }
      *state = match outcome {
        Ok(value) => TaskState::Completed(value),
        Err(PoolError::TaskCancelled) => TaskState::Cancelled,
        Err(err) => TaskState::Failed(err),
      };
      state.status()
    };
    self.wake_waiters();
    status
  }

  /// `Pending -> Cancelled` when the pool drops a queued task. Returns the resulting status.
  pub(crate) fn discard(&self) -> TaskStatus {
    let status = {
      let mut state = self.state.lock();
      if matches!(*state, TaskState::Pending) {
        *state = TaskState::Cancelled;
      }
      state.status()
    };
    self.wake_waiters();
    status
  }

  pub(crate) fn cancel(&self, may_interrupt_if_running: bool) -> CancelOutcome {
    let outcome = {
      let mut state = self.state.lock();
      match *state {
        TaskState::Pending => {
          *state = TaskState::Cancelled;
          CancelOutcome::Cancelled
        }
        TaskState::Running
          if may_interrupt_if_running && self.interruptible && !self.interrupt.is_cancelled() =>
        {
          // The executing slot observes the token at its next poll and settles as Cancelled,
          // unless the computation finishes first.
          self.interrupt.cancel();
          CancelOutcome::InterruptRequested
        }
        _ => CancelOutcome::Refused,
      }
    };
    if outcome == CancelOutcome::Cancelled {
      self.wake_waiters();
    }
    outcome
  }

  fn wake_waiters(&self) {
    self.settled.notify_all();
    self.notify.notify_waiters();
  }
}

impl<R: Clone> TaskCell<R> {
  pub(crate) fn try_outcome(&self) -> Option<Result<R, PoolError>> {
    self.state.lock().outcome()
  }

  pub(crate) async fn wait(&self) -> Result<R, PoolError> {
    loop {
      let mut notified = pin!(self.notify.notified());
      // Register before checking so a transition between the check and the await is not lost.
      notified.as_mut().enable();
      if let Some(outcome) = self.try_outcome() {
        return outcome;
      }
      notified.await;
    }
  }

  pub(crate) fn wait_blocking(&self, timeout: Option<Duration>) -> Result<R, PoolError> {
    // A timeout too large to represent as an instant waits without a deadline.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|deadline| (deadline, t)));
    let mut state = self.state.lock();
    loop {
      if let Some(outcome) = state.outcome() {
        return outcome;
      }
      match deadline {
        Some((deadline, timeout)) => {
          if self.settled.wait_until(&mut state, deadline).timed_out() {
            return state.outcome().unwrap_or(Err(PoolError::Timeout(timeout)));
          }
        }
        None => self.settled.wait(&mut state),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn test_pending_to_completed() {
    let cell = TaskCell::<u32>::new(true);
    assert_eq!(cell.status(), TaskStatus::Pending);
    assert!(cell.start());
    assert_eq!(cell.status(), TaskStatus::Running);
    assert_eq!(cell.settle(Ok(25)), TaskStatus::Completed);
    assert_eq!(cell.try_outcome(), Some(Ok(25)));
  }

  #[test]
  fn test_cancel_pending_prevents_start() {
    let cell = TaskCell::<u32>::new(true);
    assert_eq!(cell.cancel(false), CancelOutcome::Cancelled);
    assert!(!cell.start());
    assert_eq!(cell.try_outcome(), Some(Err(PoolError::TaskCancelled)));
  }

  #[test]
  fn test_terminal_state_is_final() {
    let cell = TaskCell::<u32>::new(true);
    assert!(cell.start());
    cell.settle(Err(PoolError::TaskFailed("boom".to_string())));
    assert_eq!(cell.cancel(true), CancelOutcome::Refused);
    assert_eq!(cell.settle(Ok(1)), TaskStatus::Failed);
    assert_eq!(cell.discard(), TaskStatus::Failed);
    assert_eq!(cell.try_outcome(), Some(Err(PoolError::TaskFailed("boom".to_string()))));
  }

  #[test]
  fn test_interrupt_only_for_interruptible_running_tasks() {
    let blocking = TaskCell::<u32>::new(false);
    assert!(blocking.start());
    assert_eq!(blocking.cancel(true), CancelOutcome::Refused);
    assert!(!blocking.is_interrupt_requested());

    let cooperative = TaskCell::<u32>::new(true);
    assert!(cooperative.start());
    assert_eq!(cooperative.cancel(false), CancelOutcome::Refused);
    assert_eq!(cooperative.cancel(true), CancelOutcome::InterruptRequested);
    assert!(cooperative.is_interrupt_requested());
    // Second request does not re-report success.
    assert_eq!(cooperative.cancel(true), CancelOutcome::Refused);
    // Still running until the slot settles it.
    assert_eq!(cooperative.status(), TaskStatus::Running);
    assert_eq!(cooperative.settle(Err(PoolError::TaskCancelled)), TaskStatus::Cancelled);
  }

  #[test]
  fn test_completion_wins_over_late_interrupt() {
    let cell = TaskCell::<u32>::new(true);
    assert!(cell.start());
    assert_eq!(cell.cancel(true), CancelOutcome::InterruptRequested);
    assert_eq!(cell.settle(Ok(9)), TaskStatus::Completed);
    assert_eq!(cell.try_outcome(), Some(Ok(9)));
  }

  #[test]
  fn test_wait_blocking_times_out_then_succeeds() {
    let cell = Arc::new(TaskCell::<u32>::new(true));
    assert!(cell.start());

    let result = cell.wait_blocking(Some(Duration::from_millis(20)));
    assert_eq!(result, Err(PoolError::Timeout(Duration::from_millis(20))));

    let settler = {
      let cell = cell.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        cell.settle(Ok(16));
      })
    };
    assert_eq!(cell.wait_blocking(None), Ok(16));
    settler.join().unwrap();
  }

  #[test]
  fn test_wait_blocking_accepts_unrepresentable_timeout() {
    let cell = Arc::new(TaskCell::<u32>::new(true));
    assert!(cell.start());

    let settler = {
      let cell = cell.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        cell.settle(Ok(36));
      })
    };
    assert_eq!(cell.wait_blocking(Some(Duration::MAX)), Ok(36));
    settler.join().unwrap();
  }

  #[tokio::test]
  async fn test_async_wait_wakes_on_discard() {
    let cell = Arc::new(TaskCell::<u32>::new(true));
    let waiter = {
      let cell = cell.clone();
      tokio::spawn(async move { cell.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cell.discard(), TaskStatus::Cancelled);
    assert_eq!(waiter.await.unwrap(), Err(PoolError::TaskCancelled));
  }
}
