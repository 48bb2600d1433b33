//! Recoverable errors. Wiring faults never appear here: they go through
//! `invariant_ppt::assert_invariant` and abort.

use crate::phase::{PhaseState, PhaseType};
use crate::round::RoundId;
use crate::topology::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Errors decoding or addressing slots in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream has not been linked to a round buffer")]
    NotLinked,

    #[error("slot index {index} outside stream of {size} slots")]
    IndexOutOfRange { index: u32, size: u32 },

    #[error("value is not an element of the cyclic group")]
    NotInGroup,

    #[error("malformed slot: {0}")]
    Malformed(String),
}

/// Errors returned by a cryptographic kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("kernel expects a {expected} stream")]
    StreamMismatch { expected: &'static str },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("kernel failed: {0}")]
    Failed(String),

    #[error("kernel panicked: {0}")]
    Panicked(String),
}

/// Errors from the bounded batch handoff queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,

    #[error("queue disconnected")]
    Disconnected,
}

/// Errors raised by transmission handlers and peer notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {peer}: {reason}")]
    Peer { peer: NodeId, reason: String },

    #[error("{} transmission errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<TransportError>),

    #[error("output ended before round {round_id} completed")]
    Incomplete { round_id: RoundId },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

fn join_errors(errors: &[TransportError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Recoverable graph wiring errors, reported while modules are connected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("module {0} does not exist")]
    InvalidModule(usize),

    #[error("edge {from} -> {to} would create a cycle")]
    CycleDetected { from: usize, to: usize },

    #[error("edge {from} -> {to} already exists")]
    DuplicateEdge { from: usize, to: usize },
}

/// Errors that fail a round or reject an event addressed to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error("round {0} does not exist")]
    UnknownRound(RoundId),

    #[error("round {0} already exists")]
    DuplicateRound(RoundId),

    #[error("round {0} has already failed")]
    AlreadyFailed(RoundId),

    #[error("no response registered for tag {0:?}")]
    UnknownTag(String),

    #[error("round has no {0} phase")]
    UnknownPhase(PhaseType),

    #[error("phase type {0} registered twice")]
    DuplicatePhase(PhaseType),

    #[error("{phase} is {state}, expected one of {expected:?}")]
    UnexpectedState {
        phase: PhaseType,
        state: PhaseState,
        expected: Vec<PhaseState>,
    },

    #[error("slots in one event must be contiguous")]
    NonContiguousSlots,

    #[error("topology does not contain the local node")]
    NotInTopology,

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("module {module}: {source}")]
    Kernel { module: String, source: KernelError },

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: PhaseType, after: Duration },

    #[error("{0} graph terminated before completion")]
    Terminated(PhaseType),

    #[error("could not start {phase} workers: {reason}")]
    Spawn { phase: PhaseType, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invalid node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors starting a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not start resource queue: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_failure() {
        let err = TransportError::Aggregate(vec![
            TransportError::Peer {
                peer: NodeId::new("a"),
                reason: "refused".into(),
            },
            TransportError::Queue(QueueError::Full),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 transmission errors"));
        assert!(text.contains("peer a: refused"));
        assert!(text.contains("queue full"));
    }
}
