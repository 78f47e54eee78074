//! Signal-bearing queues.
//!
//! A queue is a `crossbeam-channel` pair whose receiving side is bound to a
//! bit of the consumer's [`WaitChannel`](super::WaitChannel).

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use super::signal::Signal;
use crate::error::{CntrError, CntrResult};

/// Creates a queue bound to `signal`.
///
/// `capacity` of `None` makes the queue unbounded.
pub fn queue<T>(signal: Signal, capacity: Option<usize>) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = match capacity {
        Some(n) => crossbeam_channel::bounded(n),
        None => crossbeam_channel::unbounded(),
    };
    (
        QueueSender {
            tx,
            signal: signal.clone(),
        },
        QueueReceiver { rx, signal },
    )
}

/// Producing side of a queue. Cheap to clone.
pub struct QueueSender<T> {
    tx: Sender<T>,
    signal: Signal,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl<T> core::fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueSender")
            .field("bit", &self.signal.bit())
            .field("len", &self.tx.len())
            .finish()
    }
}

impl<T> QueueSender<T> {
    /// Enqueues `item` and signals the consumer.
    ///
    /// A full or disconnected queue yields [`CntrError::NotReady`]; the
    /// item is dropped.
    pub fn push(&self, item: T) -> CntrResult<()> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.signal.set();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(CntrError::not_ready("queue full")),
            Err(TrySendError::Disconnected(_)) => {
                Err(CntrError::not_ready("queue receiver is gone"))
            }
        }
    }

    /// Returns `true` if both senders feed the same queue.
    pub fn same_queue(&self, other: &QueueSender<T>) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Consuming side of a queue.
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    signal: Signal,
}

impl<T> core::fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueReceiver")
            .field("bit", &self.signal.bit())
            .field("len", &self.rx.len())
            .finish()
    }
}

impl<T> QueueReceiver<T> {
    /// Dequeues one item without blocking.
    ///
    /// On an empty queue the bit is cleared and the queue rechecked, so an
    /// item racing the clear is never stranded behind a cleared bit.
    pub fn pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                self.signal.clear();
                match self.rx.try_recv() {
                    Ok(item) => {
                        self.signal.set();
                        Some(item)
                    }
                    Err(_) => None,
                }
            }
        }
    }

    /// Dequeues everything currently available.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The bit this queue signals.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}
