//! Response map: how tagged network events drive a round's phases.

use crate::chunk::Chunk;
use crate::error::{RoundError, StreamError};
use crate::phase::{PhaseState, PhaseType};
use crate::stream::Slot;
use std::collections::HashMap;

/// Where an event tagged with one lookup tag goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Phase whose state gates the event.
    pub phase_at_source: PhaseType,
    /// States `phase_at_source` may be in for the event to be accepted.
    pub expected_states: Vec<PhaseState>,
    /// Phase the event is dispatched to.
    pub phase_to_execute: PhaseType,
}

impl Response {
    pub fn new(
        phase_at_source: PhaseType,
        expected_states: impl Into<Vec<PhaseState>>,
        phase_to_execute: PhaseType,
    ) -> Self {
        Self {
            phase_at_source,
            expected_states: expected_states.into(),
            phase_to_execute,
        }
    }

    /// Event that drives a phase gated on its own state.
    pub fn own(phase: PhaseType, expected_states: impl Into<Vec<PhaseState>>) -> Self {
        Self::new(phase, expected_states, phase)
    }

    pub fn accepts(&self, state: PhaseState) -> bool {
        self.expected_states.contains(&state)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseMap {
    responses: HashMap<String, Response>,
}

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `response` under `tag`, returning any response it replaces.
    pub fn insert(&mut self, tag: impl Into<String>, response: Response) -> Option<Response> {
        self.responses.insert(tag.into(), response)
    }

    pub fn with(mut self, tag: impl Into<String>, response: Response) -> Self {
        self.insert(tag, response);
        self
    }

    pub fn get(&self, tag: &str) -> Option<&Response> {
        self.responses.get(tag)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Response)> {
        self.responses.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Payload of a network event addressed to a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Contiguous slots for the target phase's input.
    Slots(Vec<Slot>),
    /// Start the target phase without input.
    Start,
    /// A peer verified the target phase's result.
    Verify,
}

impl Event {
    /// The chunk covered by a `Slots` event. Indices must be contiguous and
    /// lie below `batch_size`.
    pub(crate) fn slot_range(slots: &[Slot], batch_size: u32) -> Result<Chunk, RoundError> {
        let (Some(first), Some(last)) = (slots.first(), slots.last()) else {
            return Err(RoundError::NonContiguousSlots);
        };
        let contiguous = slots
            .iter()
            .enumerate()
            .all(|(i, s)| u64::from(s.index) == u64::from(first.index) + i as u64);
        if !contiguous {
            return Err(RoundError::NonContiguousSlots);
        }
        if last.index >= batch_size {
            return Err(StreamError::IndexOutOfRange {
                index: last.index,
                size: batch_size,
            }
            .into());
        }
        Ok(Chunk::new(first.index, last.index + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u32) -> Slot {
        Slot {
            index,
            ..Slot::default()
        }
    }

    #[test]
    fn lookup_by_tag() {
        let map = ResponseMap::new()
            .with(
                "decrypt",
                Response::own(
                    PhaseType::RealDecrypt,
                    [PhaseState::Initialized, PhaseState::Active],
                ),
            )
            .with(
                "verify",
                Response::own(PhaseType::PrecompReveal, [PhaseState::Computed]),
            );
        let r = map.get("decrypt").unwrap();
        assert!(r.accepts(PhaseState::Active));
        assert!(!r.accepts(PhaseState::Verified));
        assert_eq!(map.get("verify").unwrap().phase_to_execute, PhaseType::PrecompReveal);
        assert!(map.get("missing").is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn slot_range_requires_contiguity() {
        let range = |slots: &[Slot]| Event::slot_range(slots, 16);
        assert_eq!(range(&[slot(4), slot(5), slot(6)]), Ok(Chunk::new(4, 7)));
        assert_eq!(range(&[slot(4), slot(6)]), Err(RoundError::NonContiguousSlots));
        assert_eq!(range(&[slot(5), slot(4)]), Err(RoundError::NonContiguousSlots));
        assert_eq!(range(&[]), Err(RoundError::NonContiguousSlots));
    }

    #[test]
    fn slot_range_stays_inside_the_batch() {
        assert_eq!(Event::slot_range(&[slot(6), slot(7)], 8), Ok(Chunk::new(6, 8)));
        assert_eq!(
            Event::slot_range(&[slot(7), slot(8)], 8),
            Err(StreamError::IndexOutOfRange { index: 8, size: 8 }.into())
        );
        assert_eq!(
            Event::slot_range(&[slot(u32::MAX)], 8),
            Err(StreamError::IndexOutOfRange {
                index: u32::MAX,
                size: 8
            }
            .into())
        );
    }
}
