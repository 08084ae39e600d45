use crate::error::PoolError;
use crate::job::JobResult;

use futures::Stream;
use std::fmt;
use tokio::sync::oneshot;

/// A message in flight, plus the sender's delivery notice for rendezvous queues.
///
/// The notice fires when a consumer takes the message. If the message is
/// discarded instead, the notice is dropped and the sender learns the
/// message was never delivered.
struct QueueMessage<M> {
  message: M,
  delivered: Option<oneshot::Sender<()>>,
}

/// A bounded, multi-producer, multi-consumer FIFO queue.
///
/// Backed by an `async-channel` bounded channel, whose receive future can be
/// dropped at any point without losing a message. A capacity of `0` makes
/// every send a rendezvous: the sender waits until a consumer has taken the
/// message. A larger capacity buffers that many messages before senders
/// start waiting.
///
/// The queue closes when every [`QueueProducer`] has been dropped. Consumers
/// keep receiving whatever is still buffered and only then observe `None`.
pub struct BoundedQueue<M: Send + 'static> {
  tx: async_channel::Sender<QueueMessage<M>>,
  rx: async_channel::Receiver<QueueMessage<M>>,
  capacity: usize,
}

impl<M: Send + 'static> BoundedQueue<M> {
  pub fn new(capacity: usize) -> Self {
    // A zero-capacity rendezvous is one slot plus a delivery notice.
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    Self { tx, rx, capacity }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Splits the queue into its producer and consumer halves.
  pub fn split(self) -> (QueueProducer<M>, QueueConsumer<M>) {
    (
      QueueProducer {
        tx: self.tx,
        rendezvous: self.capacity == 0,
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

impl<M: Send + 'static> fmt::Debug for BoundedQueue<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundedQueue")
      .field("capacity", &self.capacity)
      .field("len", &self.tx.len())
      .finish()
  }
}

/// The sending half. Cloning it adds another producer; the queue stays open
/// while any clone is alive.
pub struct QueueProducer<M: Send + 'static> {
  tx: async_channel::Sender<QueueMessage<M>>,
  rendezvous: bool,
}

impl<M: Send + 'static> Clone for QueueProducer<M> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      rendezvous: self.rendezvous,
    }
  }
}

impl<M: Send + 'static> fmt::Debug for QueueProducer<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("rendezvous", &self.rendezvous)
      .finish_non_exhaustive()
  }
}

impl<M: Send + 'static> QueueProducer<M> {
  /// Pushes a message, waiting while the queue is full. On a zero-capacity
  /// queue this also waits until a consumer has taken the message.
  ///
  /// Fails when the queue was closed, or when the message was discarded
  /// before any consumer took it.
  pub async fn send(&self, message: M) -> Result<(), PoolError> {
    let (delivered, on_delivery) = if self.rendezvous {
      let (tx, rx) = oneshot::channel();
      (Some(tx), Some(rx))
    } else {
      (None, None)
    };

    self
      .tx
      .send(QueueMessage { message, delivered })
      .await
      .map_err(|_| PoolError::QueueSendChannelClosed)?;

    match on_delivery {
      Some(rx) => rx.await.map_err(|_| PoolError::QueueSendChannelClosed),
      None => Ok(()),
    }
  }

  /// Number of messages currently buffered.
  pub fn len(&self) -> usize {
    self.tx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// The receiving half. Clones compete for messages; each message is
/// delivered to exactly one consumer.
pub struct QueueConsumer<M: Send + 'static> {
  rx: async_channel::Receiver<QueueMessage<M>>,
}

impl<M: Send + 'static> Clone for QueueConsumer<M> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<M: Send + 'static> fmt::Debug for QueueConsumer<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer")
      .field("len", &self.len())
      .finish_non_exhaustive()
  }
}

impl<M: Send + 'static> QueueConsumer<M> {
  /// Waits for the next message. Returns `None` once the queue is closed and drained.
  ///
  /// Cancel safe: dropping the returned future never loses a message.
  pub async fn recv(&self) -> Option<M> {
    let taken = self.rx.recv().await.ok()?;
    Some(Self::accept(taken))
  }

  /// Takes a buffered message without waiting.
  pub fn try_recv(&self) -> Option<M> {
    self.rx.try_recv().ok().map(Self::accept)
  }

  /// Closes the queue for every producer and consumer, then drops whatever
  /// is still buffered without delivering it. Returns how many messages were
  /// discarded.
  pub fn close_and_discard(&self) -> usize {
    self.rx.close();
    let mut discarded = 0;
    while self.rx.try_recv().is_ok() {
      discarded += 1;
    }
    discarded
  }

  pub fn len(&self) -> usize {
    self.rx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Adapts the consumer into a `Stream` that ends when the queue closes.
  pub fn into_stream(self) -> impl Stream<Item = M> + Send + 'static {
    futures::stream::unfold(self, |consumer| async move {
      let next = consumer.recv().await?;
      Some((next, consumer))
    })
  }

  fn accept(taken: QueueMessage<M>) -> M {
    if let Some(delivered) = taken.delivered {
      // The sender may have stopped waiting; the message is delivered regardless.
      let _ = delivered.send(());
    }
    taken.message
  }
}

/// Read-only handle on a pool's results.
pub type ResultStream<T> = QueueConsumer<JobResult<T>>;
