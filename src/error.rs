use std::time::Duration;

use thiserror::Error;

/// Boxed error type accepted from user computations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur within the `future_pool` pool or surface through a `TaskHandle`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  InvalidConfiguration(String),

  #[error("Task computation failed: {0}")]
  TaskFailed(String),

  #[error("Submitted task panicked: {0}")]
  TaskPanicked(String),

  #[error("Task did not finish within {0:?}")]
  Timeout(Duration),

  #[error("Task was cancelled")]
  TaskCancelled,

  #[error("Pool queue is full (capacity {0}), task rejected")]
  QueueFull(usize),

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Pool's internal semaphore was closed unexpectedly")]
  SemaphoreClosed,

  #[error("Pool's internal task queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,
}

impl PoolError {
  /// Wraps an error returned by a user computation.
  pub(crate) fn from_computation<E: Into<BoxError>>(err: E) -> Self {
    PoolError::TaskFailed(err.into().to_string())
  }

  /// Builds a `TaskPanicked` from a caught panic payload.
  pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    PoolError::TaskPanicked(message)
  }
}
