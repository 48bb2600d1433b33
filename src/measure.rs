//! Measurement hooks: timing tags recorded at fixed points of a phase.

use crate::phase::PhaseType;
use crate::round::RoundId;
use parking_lot::Mutex;
use std::time::SystemTime;

pub const FIRST_SLOT_RECEIVED: &str = "first slot received";
pub const LAST_SLOT_RECEIVED: &str = "last slot received";
pub const LAST_SLOT_TRANSMITTED: &str = "last slot transmitted";
pub const VERIFICATION: &str = "verification";

/// Append-only measurement sink.
pub trait Measure: Send + Sync {
    fn measure(&self, round_id: RoundId, phase: PhaseType, tag: &'static str, at: SystemTime);
}

/// One recorded tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub round_id: RoundId,
    pub phase: PhaseType,
    pub tag: &'static str,
    pub at: SystemTime,
}

/// In-memory sink, enough for tests and local inspection.
#[derive(Debug, Default)]
pub struct Metrics {
    entries: Mutex<Vec<Measurement>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Measurement> {
        self.entries.lock().clone()
    }

    /// Tags recorded for one phase of one round, in recording order.
    pub fn tags(&self, round_id: RoundId, phase: PhaseType) -> Vec<&'static str> {
        self.entries
            .lock()
            .iter()
            .filter(|m| m.round_id == round_id && m.phase == phase)
            .map(|m| m.tag)
            .collect()
    }
}

impl Measure for Metrics {
    fn measure(&self, round_id: RoundId, phase: PhaseType, tag: &'static str, at: SystemTime) {
        tracing::trace!(round_id, phase = %phase, tag, "measure");
        self.entries.lock().push(Measurement {
            round_id,
            phase,
            tag,
            at,
        });
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMeasure;

impl Measure for NoMeasure {
    fn measure(&self, _round_id: RoundId, _phase: PhaseType, _tag: &'static str, _at: SystemTime) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_filter_by_round_and_phase() {
        let m = Metrics::new();
        let now = SystemTime::now();
        m.measure(1, PhaseType::RealDecrypt, FIRST_SLOT_RECEIVED, now);
        m.measure(2, PhaseType::RealDecrypt, FIRST_SLOT_RECEIVED, now);
        m.measure(1, PhaseType::RealDecrypt, LAST_SLOT_RECEIVED, now);
        m.measure(1, PhaseType::RealPermute, VERIFICATION, now);
        assert_eq!(
            m.tags(1, PhaseType::RealDecrypt),
            vec![FIRST_SLOT_RECEIVED, LAST_SLOT_RECEIVED]
        );
        assert_eq!(m.entries().len(), 4);
    }
}
