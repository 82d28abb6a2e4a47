use crate::error::PoolError;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::time::SystemTime;

use fibre::mpsc::{self, UnboundedAsyncReceiver, UnboundedAsyncSender};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Completed,
  Failed,
  Panicked,
  Cancelled,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Completed,
      Err(PoolError::TaskCancelled) => TaskCompletionStatus::Cancelled,
      Err(PoolError::TaskPanicked(_)) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) task_id: u64,
  pub(crate) status: TaskCompletionStatus,
  pub(crate) completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

/// Join of a spawned loop that any number of shutdown callers can await.
pub(crate) type SharedJoin = Shared<BoxFuture<'static, Result<(), String>>>;

pub(crate) fn shared_join(handle: JoinHandle<()>) -> SharedJoin {
  handle.map(|joined| joined.map_err(|e| e.to_string())).boxed().shared()
}

struct NotifierInternalState {
  sender: Option<UnboundedAsyncSender<InternalCompletionMessage>>,
  worker_join: Option<SharedJoin>,
}

/// Fans completion messages out to registered handlers.
///
/// The channel and its worker are only created once the first handler is registered, so a
/// pool without handlers never buffers notifications.
pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  init_once: Once,
  internal_state: Mutex<NotifierInternalState>,
  tokio_handle: TokioHandle,
  pool_name: Arc<String>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(tokio_handle: TokioHandle, pool_name: Arc<String>) -> Self {
    Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      internal_state: Mutex::new(NotifierInternalState {
        sender: None,
        worker_join: None,
      }),
      tokio_handle,
      pool_name,
    }
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      info!(pool_name = %*self.pool_name, "First completion handler added. Initializing notification worker.");
      let (tx, rx) = mpsc::unbounded_async();
      let worker_jh = self.tokio_handle.spawn(
        Self::run_notification_worker_loop(rx, self.handlers.clone(), self.pool_name.clone())
          .instrument(info_span!("notification_worker_loop", pool_name = %*self.pool_name)),
      );
      let mut state = self.internal_state.lock();
      state.sender = Some(tx);
      state.worker_join = Some(shared_join(worker_jh));
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(pool_name = %*self.pool_name, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  /// Sender for completion messages, `None` while no handler is registered or after close.
  fn sender(&self) -> Option<UnboundedAsyncSender<InternalCompletionMessage>> {
    self.internal_state.lock().sender.clone()
  }

  /// Queues one notification. A no-op when nobody listens.
  pub(crate) async fn notify(&self, task_id: u64, status: TaskCompletionStatus) {
    if let Some(mut tx) = self.sender() {
      Self::send(&mut tx, task_id, status).await;
    }
  }

  async fn send(tx: &mut UnboundedAsyncSender<InternalCompletionMessage>, task_id: u64, status: TaskCompletionStatus) {
    let message = InternalCompletionMessage {
      task_id,
      status,
      completion_time: SystemTime::now(),
    };
    if tx.send(message).await.is_err() {
      trace!(%task_id, "Notifier: channel closed, completion notification dropped.");
    }
  }

  async fn run_notification_worker_loop(
    mut queue_rx: UnboundedAsyncReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    pool_name: Arc<String>,
  ) {
    info!("Notification worker started. Will process messages until its input queue is closed by all senders.");
    loop {
      match queue_rx.recv().await {
        Ok(message) => {
          // Snapshot so a handler may register further handlers without deadlocking.
          let current_handlers: Vec<CompletionHandler> = handlers.read().clone();
          let info = TaskCompletionInfo {
            task_id: message.task_id,
            pool_name: pool_name.clone(),
            status: message.status,
            completion_time: message.completion_time,
          };
          debug!(task_id = %info.task_id, status = ?info.status, "Dispatching notification to {} handlers.", current_handlers.len());
          for handler in current_handlers {
            let info_for_handler = info.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(info_for_handler))).is_err() {
              error!(task_id = %info.task_id, "A completion handler panicked during execution.");
            }
          }
        }
        Err(_disconnected) => {
          info!("Notification worker: all senders dropped. Terminating.");
          break;
        }
      }
    }
    info!("Notification worker stopped (input queue fully closed and processed).");
  }

  /// Drops the pool's sender and waits for the worker to drain what is queued.
  /// Every caller waits for the same drain, so overlapping shutdowns all return after it.
  /// Callers must make sure no execution slot still holds a sender clone.
  pub(crate) async fn close_and_join(&self) {
    let join_option = {
      let mut state = self.internal_state.lock();
      state.sender = None;
      state.worker_join.clone()
    };

    if let Some(join) = join_option {
      info!(pool_name = %*self.pool_name, "Notifier: Waiting for notification worker loop to join.");
      if let Err(e) = join.await {
        error!(pool_name = %*self.pool_name, "Notifier: Error joining notification worker: {}", e);
      } else {
        debug!(pool_name = %*self.pool_name, "Notifier: Notification worker loop joined.");
      }
    } else {
      trace!(pool_name = %*self.pool_name, "Notifier: Worker was never initialized.");
    }
  }
}
