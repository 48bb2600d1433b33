//! Bounded, non-blocking handoff queues between the node and its gateway.

use crate::error::QueueError;
use crate::round::RoundId;
use crate::stream::Slot;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// A finished realtime batch, ready for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRound {
    pub round_id: RoundId,
    pub slots: Vec<Slot>,
}

/// The node asks its gateway for a new batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub round_id: RoundId,
    pub batch_size: u32,
}

/// Fixed-capacity MPMC queue. Both ends never block: a full queue rejects
/// the item and an empty one yields `None`.
#[derive(Debug)]
pub struct BatchQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> BatchQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn send(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    pub fn recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_rejects_without_growing() {
        let q = BatchQueue::new(2);
        q.send(BatchRequest { round_id: 1, batch_size: 8 }).unwrap();
        q.send(BatchRequest { round_id: 2, batch_size: 8 }).unwrap();
        assert_eq!(
            q.send(BatchRequest { round_id: 3, batch_size: 8 }),
            Err(QueueError::Full)
        );
        assert_eq!(q.len(), 2);
        assert_eq!(q.recv().map(|r| r.round_id), Some(1));
        assert_eq!(q.recv().map(|r| r.round_id), Some(2));
        assert_eq!(q.recv(), None);
    }
}
