//! Module input queues: bounded MPMC FIFOs of chunks with an explicit close.
//!
//! Closing drops the only sender, so every blocked receiver wakes and, once
//! the buffered chunks are drained, observes the queue as finished.

use crate::chunk::Chunk;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::time::Duration;

/// Returned by [`ChunkQueue::send`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed(pub Chunk);

/// Outcome of a non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecv {
    Chunk(Chunk),
    Empty,
    Drained,
}

#[derive(Debug)]
pub struct ChunkQueue {
    sender: RwLock<Option<Sender<Chunk>>>,
    receiver: Receiver<Chunk>,
    capacity: usize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            sender: RwLock::new(Some(tx)),
            receiver: rx,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Push a chunk, blocking while the queue is full.
    pub fn send(&self, chunk: Chunk) -> Result<(), QueueClosed> {
        let guard = self.sender.read();
        match guard.as_ref() {
            Some(tx) => tx.send(chunk).map_err(|e| QueueClosed(e.0)),
            None => Err(QueueClosed(chunk)),
        }
    }

    /// Close the queue. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    /// Block for the next chunk; `None` once closed and drained.
    pub fn recv(&self) -> Option<Chunk> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Chunk, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> TryRecv {
        match self.receiver.try_recv() {
            Ok(chunk) => TryRecv::Chunk(chunk),
            Err(TryRecvError::Empty) => TryRecv::Empty,
            Err(TryRecvError::Disconnected) => TryRecv::Drained,
        }
    }

    /// Receiver handle for use in `select!` alongside other signals.
    pub fn receiver(&self) -> &Receiver<Chunk> {
        &self.receiver
    }
}
