use crate::config::PoolConfig;
use crate::error::{BoxError, PoolError};
use crate::handle::TaskHandle;
use crate::notifier::{shared_join, CompletionNotifier, SharedJoin, TaskCompletionInfo, TaskCompletionStatus};
use crate::state::TaskCell;
use crate::task::{BlockingJob, Job, TaskToExecute, WorkItem};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool treats in-flight tasks upon shutdown.
///
/// In both modes queued tasks that have not started are discarded and their handles report
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for currently running tasks to complete.
  Graceful,
  /// Requests interruption of every running task, then waits for them to settle.
  /// Blocking computations and async computations without a pending `.await` still finish.
  ForcefulCancel,
}

/// Cells of the tasks currently executing, keyed by task id.
type ActiveTasks<R> = Arc<DashMap<u64, Arc<TaskCell<R>>>>;

/// Everything the dispatcher loop and the execution slots share.
struct DispatchContext<R: Send + 'static> {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  tokio_handle: TokioHandle,
  active_tasks: ActiveTasks<R>,
  notifier: Arc<CompletionNotifier>,
  shutdown_token: CancellationToken,
}

/// A pool executing submitted computations on at most `width` slots at a time.
///
/// Submissions are queued in FIFO order and handed to free slots by a single dispatcher task
/// running on the given Tokio runtime.
pub struct WorkerPool<R: Send + 'static> {
  pool_name: Arc<String>,
  width: usize,
  semaphore: Arc<Semaphore>,
  queue: QueueProducer<R>,
  active_tasks: ActiveTasks<R>,
  shutdown_token: CancellationToken,
  notifier: Arc<CompletionNotifier>,
  dispatcher_join: SharedJoin,
}

impl<R: Send + 'static> fmt::Debug for WorkerPool<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &self.pool_name)
      .field("width", &self.width)
      .field("active", &self.active_task_count())
      .field("queue", &self.queue)
      .field("shutting_down", &self.is_shutting_down())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> WorkerPool<R> {
  /// Creates a pool of `width` slots with an unbounded queue on the current Tokio runtime.
  ///
  /// # Errors
  /// `PoolError::InvalidConfiguration` if `width` is 0 or no runtime is current.
  pub fn new(width: usize) -> Result<Arc<Self>, PoolError> {
    let tokio_handle = TokioHandle::try_current()
      .map_err(|e| PoolError::InvalidConfiguration(format!("no Tokio runtime available: {}", e)))?;
    Self::with_config(PoolConfig::new(width), tokio_handle)
  }

  pub fn with_config(config: PoolConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    config.validate()?;

    let pool_name = Arc::new(config.name);
    let (producer, consumer) = TaskQueue::new(config.queue_capacity).split();
    let semaphore = Arc::new(Semaphore::new(config.width));
    let active_tasks = Arc::new(DashMap::new());
    let shutdown_token = CancellationToken::new();
    let notifier = Arc::new(CompletionNotifier::new(tokio_handle.clone(), pool_name.clone()));

    let context = DispatchContext {
      pool_name: pool_name.clone(),
      semaphore: semaphore.clone(),
      tokio_handle: tokio_handle.clone(),
      active_tasks: active_tasks.clone(),
      notifier: notifier.clone(),
      shutdown_token: shutdown_token.clone(),
    };
    let dispatcher_join_handle = tokio_handle.spawn(
      Self::run_dispatcher_loop(context, consumer)
        .instrument(info_span!("worker_pool_dispatcher", name = %*pool_name)),
    );

    info!(pool_name = %*pool_name, width = config.width, queue_capacity = ?config.queue_capacity, "Worker pool created.");

    Ok(Arc::new(Self {
      pool_name,
      width: config.width,
      semaphore,
      queue: producer,
      active_tasks,
      shutdown_token,
      notifier,
      dispatcher_join: shared_join(dispatcher_join_handle),
    }))
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn width(&self) -> usize {
    self.width
  }

  /// Number of tasks currently executing.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  /// Returns the current number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.queue.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Registers a handler invoked once for every task that reaches a terminal state from now on.
  pub fn on_completion(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Submits an async computation applied to `input`.
  ///
  /// Returns immediately with a `Pending` handle; the computation is not invoked until a slot
  /// picks it up. An `Err` returned by the computation surfaces as `PoolError::TaskFailed`
  /// through the handle, a panic as `PoolError::TaskPanicked`.
  ///
  /// # Errors
  /// `PoolError::PoolShuttingDown` after shutdown started, `PoolError::QueueFull` when the
  /// bounded queue has no room.
  pub fn submit<I, F, Fut, E>(&self, computation: F, input: I) -> Result<TaskHandle<R>, PoolError>
  where
    I: Send + 'static,
    F: FnOnce(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
  {
    let future: TaskToExecute<R> =
      Box::pin(async move { computation(input).await.map_err(PoolError::from_computation) });
    self.enqueue(Job::Async(future))
  }

  /// Submits a synchronous computation applied to `input`, run on Tokio's blocking thread pool.
  ///
  /// Counts against the pool width like any other task. Once running it cannot be interrupted.
  pub fn submit_blocking<I, F, E>(&self, computation: F, input: I) -> Result<TaskHandle<R>, PoolError>
  where
    I: Send + 'static,
    F: FnOnce(I) -> Result<R, E> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
  {
    let job: BlockingJob<R> = Box::new(move || computation(input).map_err(PoolError::from_computation));
    self.enqueue(Job::Blocking(job))
  }

  fn enqueue(&self, job: Job<R>) -> Result<TaskHandle<R>, PoolError> {
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let cell = Arc::new(TaskCell::new(job.is_interruptible()));
    debug!(pool_name = %self.pool_name, %task_id, kind = job.kind(), "Submitting task to queue.");

    let item = WorkItem {
      task_id,
      job,
      cell: cell.clone(),
    };
    match self.queue.try_send(item, &self.shutdown_token) {
      Ok(()) => Ok(TaskHandle { task_id, cell }),
      Err(e) => {
        warn!(pool_name = %self.pool_name, %task_id, error = %e, "Submit: Task rejected.");
        Err(e)
      }
    }
  }

  /// Stops the pool.
  ///
  /// New submissions are refused immediately. Tasks still queued are discarded and their handles
  /// report `Cancelled`. Running tasks finish (`Graceful`) or are asked to interrupt
  /// (`ForcefulCancel`). Resolves once every running task settled and pending completion
  /// notifications were delivered. Calling it again is harmless.
  pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), PoolError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    // Every caller waits for the dispatcher to exit, including its discard notifications.
    info!(pool_name = %self.pool_name, "Waiting for dispatcher loop to join.");
    if let Err(join_error) = self.dispatcher_join.clone().await {
      error!(pool_name = %self.pool_name, "Error joining dispatcher loop during shutdown: {}.", join_error);
    }

    // The dispatcher has exited, so no task can start after this snapshot.
    if mode == ShutdownMode::ForcefulCancel {
      let tasks_to_interrupt: Vec<(u64, Arc<TaskCell<R>>)> = self
        .active_tasks
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();
      if tasks_to_interrupt.is_empty() {
        info!(pool_name = %self.pool_name, "No active tasks to interrupt.");
      }
      for (task_id, cell) in tasks_to_interrupt {
        let outcome = cell.cancel(true);
        debug!(pool_name = %self.pool_name, %task_id, ?outcome, "Forceful shutdown: interrupt requested for active task.");
      }
    } else {
      info!(pool_name = %self.pool_name, "Graceful shutdown: Allowing active tasks to complete.");
    }

    // Every running task holds one permit until it has settled and notified.
    // Width fits in u32, see PoolConfig::validate.
    let all_slots = self
      .semaphore
      .acquire_many(self.width as u32)
      .await
      .map_err(|_| PoolError::SemaphoreClosed)?;
    drop(all_slots);
    debug!(pool_name = %self.pool_name, "All in-flight tasks settled.");

    self.notifier.close_and_join().await;

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
    Ok(())
  }

  async fn run_dispatcher_loop(context: DispatchContext<R>, mut queue_rx: QueueConsumer<R>) {
    let pool_name = context.pool_name.clone();
    info!(name = %*pool_name, "Dispatcher loop started.");

    loop {
      let permit = tokio::select! {
        biased;
        _ = context.shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Shutdown signal (token) received. Dispatcher loop terminating.");
          break;
        }
        acquired = context.semaphore.clone().acquire_owned() => match acquired {
          Ok(permit) => permit,
          Err(_) => {
            error!(name = %*pool_name, "Semaphore closed. Dispatcher loop exiting.");
            break;
          }
        }
      };
      trace!(name = %*pool_name, "Acquired semaphore permit. Available: {}", context.semaphore.available_permits());

      let item = tokio::select! {
        biased;
        _ = context.shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Shutdown signal (token) received while holding permit and waiting for task. Releasing permit.");
          break;
        }
        received = queue_rx.recv() => match received {
          Some(item) => item,
          None => {
            info!(name = %*pool_name, "Task queue closed and empty. Releasing permit.");
            break;
          }
        }
      };

      if context.shutdown_token.is_cancelled() {
        Self::discard(&context, item).await;
        break;
      }

      if !item.cell.start() {
        debug!(name = %*pool_name, task_id = item.task_id, "Dequeued task already cancelled, skipping.");
        context.notifier.notify(item.task_id, TaskCompletionStatus::Cancelled).await;
        continue;
      }

      Self::spawn_execution(&context, item, permit);
    }

    let discarded = queue_rx.close_and_drain();
    if !discarded.is_empty() {
      info!(name = %*pool_name, "Discarding {} queued task(s) that never started.", discarded.len());
    }
    for item in discarded {
      Self::discard(&context, item).await;
    }

    info!(
      name = %*pool_name,
      "Dispatcher loop stopped. Tasks still running: {}",
      context.active_tasks.len()
    );
  }

  async fn discard(context: &DispatchContext<R>, item: WorkItem<R>) {
    let status = item.cell.discard();
    debug!(name = %*context.pool_name, task_id = item.task_id, ?status, "Queued task discarded by shutdown.");
    context.notifier.notify(item.task_id, TaskCompletionStatus::Cancelled).await;
  }

  fn spawn_execution(context: &DispatchContext<R>, item: WorkItem<R>, permit: OwnedSemaphorePermit) {
    let WorkItem { task_id, job, cell } = item;
    let interrupt = cell.interrupt_token().clone();
    context.active_tasks.insert(task_id, cell.clone());
    debug!(name = %*context.pool_name, %task_id, kind = job.kind(), "Dequeued task. Spawning with permit.");

    let active_tasks = context.active_tasks.clone();
    let notifier = context.notifier.clone();
    let blocking_handle = context.tokio_handle.clone();

    context.tokio_handle.spawn(
      async move {
        let _permit = permit;

        let outcome: Result<R, PoolError> = match job {
          Job::Async(task_future) => tokio::select! {
            biased;
            _ = interrupt.cancelled() => {
              debug!(%task_id, "Task interrupted at an await point.");
              Err(PoolError::TaskCancelled)
            }
            task_result = AssertUnwindSafe(task_future).catch_unwind() => {
              task_result.unwrap_or_else(|panic_payload| {
                error!(%task_id, "Task panicked during execution.");
                Err(PoolError::from_panic(panic_payload))
              })
            }
          },
          Job::Blocking(run) => match blocking_handle.spawn_blocking(run).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
              error!(%task_id, "Blocking task panicked during execution.");
              Err(PoolError::from_panic(join_error.into_panic()))
            }
            Err(join_error) => {
              warn!(%task_id, "Blocking task did not run to completion: {}", join_error);
              Err(PoolError::TaskCancelled)
            }
          },
        };

        let completion_status = TaskCompletionStatus::from(&outcome);
        let stored = cell.settle(outcome);
        active_tasks.remove(&task_id);
        trace!(%task_id, ?stored, "Task settled.");

        notifier.notify(task_id, completion_status).await;
      }
      .instrument(info_span!("pool_task", pool_name = %*context.pool_name, %task_id)),
    );
  }
}

impl<R: Send + 'static> Drop for WorkerPool<R> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      // The dispatcher notices the token, discards queued tasks and exits on its own.
      // Running tasks keep going; nothing here waits.
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool instance dropped. Initiating implicit shutdown."
      );
      self.shutdown_token.cancel();
    } else {
      trace!(
        pool_name = %*self.pool_name,
        "Drop: Shutdown already in progress or completed. No new signals sent."
      );
    }
  }
}
