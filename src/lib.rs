//! A Tokio-based worker pool for submitting computations and tracking them through
//! pollable, awaitable and cancellable task handles.

mod config;
mod error;
mod handle;
mod notifier;
mod pool;
mod state;
mod task;
mod task_queue;

pub use config::PoolConfig;
pub use error::{BoxError, PoolError};
pub use handle::TaskHandle;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use pool::{ShutdownMode, WorkerPool};
pub use state::TaskStatus;
