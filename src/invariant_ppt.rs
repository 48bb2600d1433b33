//! PPT Invariant System: the single fatal path for dispatch invariant violations.
//!
//! Wiring and accounting faults (weight overflow, illegal phase transitions,
//! sends on closed queues, malformed graphs) cannot be recovered in place.
//! Every such check goes through [`assert_invariant`], which logs the fault
//! and panics. With the `ppt` feature the ids of asserted invariants are
//! recorded so tests can prove a check actually ran.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

pub const WEIGHT_OVERFLOW: u32 = 1;
pub const COMPLETION_OVERFLOW: u32 = 2;
pub const ILLEGAL_TRANSITION: u32 = 3;
pub const CLOSED_QUEUE_SEND: u32 = 4;
pub const CHUNK_DIVIDES_ASSIGNMENT: u32 = 5;
pub const THREAD_BOUNDS: u32 = 6;
pub const GRAPH_REACHABLE: u32 = 7;
pub const GRAPH_SHAPE: u32 = 8;
pub const PHASE_REBIND: u32 = 9;
pub const STREAM_RELINK: u32 = 10;
pub const THRESHOLD_RANGE: u32 = 11;
pub const GRAPH_LIFECYCLE: u32 = 12;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

/// Assert an invariant: logs it and panics on failure.
#[track_caller]
pub fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = match context {
            Some(ctx) => format!(
                "Invariant {} ({}) failed: {} (context: {})",
                id,
                invariant_name(id),
                message,
                ctx
            ),
            None => format!("Invariant {} ({}) failed: {}", id, invariant_name(id), message),
        };
        tracing::error!(invariant = id, "{}", full_message);
        panic!("{}", full_message);
    }
    #[cfg(feature = "ppt")]
    INVARIANT_LOG.lock().insert(id);
}

/// Maps invariant ID to a human-readable name (for diagnostics only).
pub const fn invariant_name(id: u32) -> &'static str {
    match id {
        WEIGHT_OVERFLOW => "WEIGHT_OVERFLOW",
        COMPLETION_OVERFLOW => "COMPLETION_OVERFLOW",
        ILLEGAL_TRANSITION => "ILLEGAL_TRANSITION",
        CLOSED_QUEUE_SEND => "CLOSED_QUEUE_SEND",
        CHUNK_DIVIDES_ASSIGNMENT => "CHUNK_DIVIDES_ASSIGNMENT",
        THREAD_BOUNDS => "THREAD_BOUNDS",
        GRAPH_REACHABLE => "GRAPH_REACHABLE",
        GRAPH_SHAPE => "GRAPH_SHAPE",
        PHASE_REBIND => "PHASE_REBIND",
        STREAM_RELINK => "STREAM_RELINK",
        THRESHOLD_RANGE => "THRESHOLD_RANGE",
        GRAPH_LIFECYCLE => "GRAPH_LIFECYCLE",
        _ => "UNKNOWN",
    }
}

/// Panic unless every id in `required` has been asserted at least once in
/// this process. The panic names the ids that never ran.
#[cfg(feature = "ppt")]
pub fn contract_test(label: &str, required: &[u32]) {
    let unchecked: Vec<&str> = {
        let seen = INVARIANT_LOG.lock();
        required
            .iter()
            .filter(|id| !seen.contains(id))
            .map(|&id| invariant_name(id))
            .collect()
    };
    assert!(
        unchecked.is_empty(),
        "{}: never checked {:?}",
        label,
        unchecked
    );
}

/// Without `ppt` nothing is recorded, so there is nothing to verify.
#[cfg(not(feature = "ppt"))]
pub fn contract_test(_label: &str, _required: &[u32]) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_invariant_does_not_panic() {
        assert_invariant(GRAPH_SHAPE, 1 + 1 == 2, "shape holds", Some("basic"));
    }

    #[test]
    #[should_panic(expected = "WEIGHT_OVERFLOW")]
    fn failing_invariant_panics_with_name() {
        assert_invariant(WEIGHT_OVERFLOW, false, "count exceeded max", None);
    }

    #[test]
    fn contract_sees_asserted_ids() {
        assert_invariant(STREAM_RELINK, true, "linked once", None);
        contract_test("stream relink checked", &[STREAM_RELINK]);
    }

    #[cfg(feature = "ppt")]
    #[test]
    #[should_panic(expected = "never checked")]
    fn contract_names_unchecked_ids() {
        contract_test("nothing asserts id 200", &[200]);
    }

    #[test]
    fn names_cover_every_id() {
        for id in WEIGHT_OVERFLOW..=GRAPH_LIFECYCLE {
            assert_ne!(invariant_name(id), "UNKNOWN");
        }
        assert_eq!(invariant_name(255), "UNKNOWN");
    }
}
