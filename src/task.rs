use crate::error::PoolError;
use crate::state::TaskCell;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The type of future that the pool executes for async computations.
/// The user computation's error is already folded into `PoolError` at this point.
pub(crate) type TaskToExecute<R> = Pin<Box<dyn Future<Output = Result<R, PoolError>> + Send + 'static>>;

/// A synchronous computation bound to its input, run on Tokio's blocking thread pool.
pub(crate) type BlockingJob<R> = Box<dyn FnOnce() -> Result<R, PoolError> + Send + 'static>;

/// What a work item runs once it is dispatched.
pub(crate) enum Job<R: Send + 'static> {
  /// Interruptible at every `.await` point.
  Async(TaskToExecute<R>),
  /// Runs to completion once started.
  Blocking(BlockingJob<R>),
}

impl<R: Send + 'static> Job<R> {
  pub(crate) fn is_interruptible(&self) -> bool {
    matches!(self, Job::Async(_))
  }

  pub(crate) fn kind(&self) -> &'static str {
    match self {
      Job::Async(_) => "async",
      Job::Blocking(_) => "blocking",
    }
  }
}

/// Internal representation of a task managed by the pool.
pub(crate) struct WorkItem<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) job: Job<R>,
  pub(crate) cell: Arc<TaskCell<R>>,
}
