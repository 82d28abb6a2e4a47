use crate::error::PoolError;
use crate::task::WorkItem;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Counts items waiting in the queue and enforces the optional capacity.
#[derive(Debug)]
struct QueueGate {
  queued: AtomicUsize,
  capacity: Option<usize>,
}

impl QueueGate {
  fn try_acquire(self: &Arc<Self>) -> Option<Slot> {
    let acquired = self
      .queued
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| match self.capacity {
        Some(capacity) if queued >= capacity => None,
        _ => Some(queued + 1),
      })
      .is_ok();
    acquired.then(|| Slot { gate: self.clone() })
  }

  fn queued(&self) -> usize {
    self.queued.load(Ordering::Acquire)
  }
}

/// One occupied queue slot. Released on drop, which happens once the dispatcher has taken the
/// item out of the channel (or the item was drained at shutdown).
#[derive(Debug)]
struct Slot {
  gate: Arc<QueueGate>,
}

impl Drop for Slot {
  fn drop(&mut self) {
    self.gate.queued.fetch_sub(1, Ordering::AcqRel);
  }
}

struct QueueMessage<R: Send + 'static> {
  item: WorkItem<R>,
  _slot: Slot,
}

/// FIFO intake queue between submitters and the dispatcher.
///
/// An unbounded Tokio channel carries the items so that sending never waits; the `QueueGate`
/// layered on top turns a configured capacity into immediate rejection.
pub(crate) struct TaskQueue<R: Send + 'static> {
  tx: UnboundedSender<QueueMessage<R>>,
  rx: UnboundedReceiver<QueueMessage<R>>,
  gate: Arc<QueueGate>,
}

impl<R: Send + 'static> TaskQueue<R> {
  pub(crate) fn new(capacity: Option<usize>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx,
      gate: Arc::new(QueueGate {
        queued: AtomicUsize::new(0),
        capacity,
      }),
    }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<R>, QueueConsumer<R>) {
    (
      QueueProducer {
        tx: self.tx,
        gate: self.gate,
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

/// Producer half, owned by the pool.
pub(crate) struct QueueProducer<R: Send + 'static> {
  tx: UnboundedSender<QueueMessage<R>>,
  gate: Arc<QueueGate>,
}

/// Consumer half, owned by the dispatcher loop.
pub(crate) struct QueueConsumer<R: Send + 'static> {
  rx: UnboundedReceiver<QueueMessage<R>>,
}

impl<R: Send + 'static> fmt::Debug for QueueProducer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("capacity", &self.gate.capacity)
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> QueueProducer<R> {
  /// Enqueues an item without waiting.
  ///
  /// # Errors
  /// `PoolShuttingDown` once shutdown started or the consumer is gone,
  /// `QueueFull` if the configured capacity is reached.
  pub(crate) fn try_send(&self, item: WorkItem<R>, shutdown_token: &CancellationToken) -> Result<(), PoolError> {
    if shutdown_token.is_cancelled() || self.tx.is_closed() {
      return Err(PoolError::PoolShuttingDown);
    }

    let slot = match self.gate.try_acquire() {
      Some(slot) => slot,
      None => return Err(PoolError::QueueFull(self.gate.capacity.unwrap_or_default())),
    };

    // On failure the message, and with it the slot, is dropped here.
    self.tx.send(QueueMessage { item, _slot: slot }).map_err(|_| {
      if shutdown_token.is_cancelled() {
        PoolError::PoolShuttingDown
      } else {
        PoolError::QueueSendChannelClosed
      }
    })
  }

  /// Number of items waiting for dispatch.
  pub(crate) fn len(&self) -> usize {
    self.gate.queued()
  }
}

impl<R: Send + 'static> QueueConsumer<R> {
  /// Receives the next item in submission order. `None` once every producer is gone.
  pub(crate) async fn recv(&mut self) -> Option<WorkItem<R>> {
    self.rx.recv().await.map(|message| message.item)
  }

  /// Closes the queue to further sends and returns everything still buffered, in order.
  pub(crate) fn close_and_drain(&mut self) -> Vec<WorkItem<R>> {
    self.rx.close();
    let mut drained = Vec::new();
    while let Ok(message) = self.rx.try_recv() {
      drained.push(message.item);
    }
    drained
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::state::TaskCell;
  use crate::task::{Job, TaskToExecute};
  use std::time::Duration;

  // Helper to create a dummy WorkItem for testing the queue.
  fn dummy_item(id: u64) -> WorkItem<String> {
    let future: TaskToExecute<String> = Box::pin(async move { Ok("done".to_string()) });
    WorkItem {
      task_id: id,
      job: Job::Async(future),
      cell: Arc::new(TaskCell::new(true)),
    }
  }

  #[tokio::test]
  async fn test_queue_send_recv() {
    let (producer, mut consumer) = TaskQueue::<String>::new(Some(5)).split();
    let shutdown_token = CancellationToken::new();

    producer.try_send(dummy_item(1), &shutdown_token).unwrap();
    assert_eq!(producer.len(), 1);

    let received = consumer.recv().await.unwrap();
    assert_eq!(received.task_id, 1);
    // The slot is released as soon as the item leaves the channel.
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_queue_preserves_submission_order() {
    let (producer, mut consumer) = TaskQueue::<String>::new(None).split();
    let shutdown_token = CancellationToken::new();

    for id in 0..10 {
      producer.try_send(dummy_item(id), &shutdown_token).unwrap();
    }
    for expected in 0..10 {
      assert_eq!(consumer.recv().await.unwrap().task_id, expected);
    }
  }

  #[tokio::test]
  async fn test_queue_capacity_rejects_send() {
    let (producer, mut consumer) = TaskQueue::<String>::new(Some(1)).split();
    let shutdown_token = CancellationToken::new();

    producer.try_send(dummy_item(1), &shutdown_token).unwrap();
    let rejected = producer.try_send(dummy_item(2), &shutdown_token);
    assert_eq!(rejected.err(), Some(PoolError::QueueFull(1)));
    assert_eq!(producer.len(), 1);

    assert_eq!(consumer.recv().await.unwrap().task_id, 1);
    producer.try_send(dummy_item(3), &shutdown_token).unwrap();
    assert_eq!(consumer.recv().await.unwrap().task_id, 3);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_queue_concurrent_sends() {
    let (producer, mut consumer) = TaskQueue::<String>::new(None).split();
    let producer = Arc::new(producer);
    let shutdown_token = CancellationToken::new();
    let num_items: u64 = 20;

    let mut senders = Vec::new();
    for i in 0..num_items {
      let p = producer.clone();
      let s = shutdown_token.clone();
      senders.push(tokio::spawn(async move { p.try_send(dummy_item(i), &s).unwrap() }));
    }
    for sender in senders {
      sender.await.unwrap();
    }

    let mut received = 0;
    while received < num_items {
      tokio::time::timeout(Duration::from_secs(1), consumer.recv())
        .await
        .expect("queue stalled")
        .unwrap();
      received += 1;
    }
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_send_respects_shutdown_token() {
    let (producer, _consumer) = TaskQueue::<String>::new(Some(1)).split();
    let shutdown_token = CancellationToken::new();

    producer.try_send(dummy_item(1), &shutdown_token).unwrap();
    shutdown_token.cancel();

    let result = producer.try_send(dummy_item(2), &shutdown_token);
    assert_eq!(result.err(), Some(PoolError::PoolShuttingDown));
    assert_eq!(producer.len(), 1, "Slot should still be held by the first item");
  }

  #[tokio::test]
  async fn test_close_and_drain_returns_leftovers() {
    let (producer, mut consumer) = TaskQueue::<String>::new(Some(4)).split();
    let shutdown_token = CancellationToken::new();

    for id in 1..=3 {
      producer.try_send(dummy_item(id), &shutdown_token).unwrap();
    }
    assert_eq!(consumer.recv().await.unwrap().task_id, 1);

    let drained: Vec<u64> = consumer.close_and_drain().iter().map(|item| item.task_id).collect();
    assert_eq!(drained, vec![2, 3]);
    assert_eq!(producer.len(), 0);

    let result = producer.try_send(dummy_item(4), &shutdown_token);
    assert_eq!(result.err(), Some(PoolError::PoolShuttingDown));
  }
}
