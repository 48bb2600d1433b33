//! Rounds: the per-round buffer, phases and response map, plus the manager
//! that indexes live rounds by id.

use crate::error::RoundError;
use crate::group::CyclicGroup;
use crate::measure::Measure;
use crate::phase::{Phase, PhaseBinding, PhaseState, PhaseType};
use crate::resource_queue::ResourceQueue;
use crate::response::{Event, ResponseMap};
use crate::round_buffer::RoundBuffer;
use crate::topology::Topology;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type RoundId = u64;

/// Called once per round when it fails.
pub type RoundErrorHandler = Arc<dyn Fn(RoundId, &RoundError) + Send + Sync>;

/// Collaborators shared by every round of a node.
#[derive(Clone)]
pub struct RoundEnv {
    pub group: Arc<CyclicGroup>,
    pub measure: Arc<dyn Measure>,
    pub on_error: Option<RoundErrorHandler>,
}

/// Failure state of a round, shared with its phases.
pub struct RoundStatus {
    round_id: RoundId,
    failed: AtomicBool,
    error: Mutex<Option<RoundError>>,
    on_error: Option<RoundErrorHandler>,
}

impl fmt::Debug for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundStatus")
            .field("round_id", &self.round_id)
            .field("failed", &self.is_failed())
            .field("error", &*self.error.lock())
            .finish()
    }
}

impl RoundStatus {
    fn new(round_id: RoundId, on_error: Option<RoundErrorHandler>) -> Self {
        Self {
            round_id,
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            on_error,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The error the round failed with.
    pub fn error(&self) -> Option<RoundError> {
        self.error.lock().clone()
    }

    /// Mark the round failed. Only the first failure is kept and reported.
    pub fn fail(&self, error: RoundError) -> bool {
        if self.failed.swap(true, Ordering::AcqRel) {
            tracing::debug!(round_id = self.round_id, %error, "round already failed");
            return false;
        }
        tracing::warn!(round_id = self.round_id, %error, "round failed");
        if let Some(handler) = &self.on_error {
            handler(self.round_id, &error);
        }
        *self.error.lock() = Some(error);
        true
    }
}

pub struct Round {
    id: RoundId,
    topology: Arc<Topology>,
    batch_size: u32,
    buffer: Arc<RoundBuffer>,
    phases: HashMap<PhaseType, Arc<Phase>>,
    responses: ResponseMap,
    status: Arc<RoundStatus>,
}

impl fmt::Debug for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut phases: Vec<_> = self.phases.keys().collect();
        phases.sort();
        f.debug_struct("Round")
            .field("id", &self.id)
            .field("batch_size", &self.batch_size)
            .field("topology", &self.topology)
            .field("phases", &phases)
            .field("failed", &self.status.is_failed())
            .finish()
    }
}

impl Round {
    /// Allocate the round buffer, then build, link and bind every phase.
    pub fn new(
        id: RoundId,
        topology: Topology,
        batch_size: u32,
        phases: Vec<Phase>,
        responses: ResponseMap,
        env: &RoundEnv,
    ) -> Result<Self, RoundError> {
        let mut seen = Vec::with_capacity(phases.len());
        for phase in &phases {
            if seen.contains(&phase.phase_type()) {
                return Err(RoundError::DuplicatePhase(phase.phase_type()));
            }
            seen.push(phase.phase_type());
        }
        for (_, response) in responses.iter() {
            for t in [response.phase_at_source, response.phase_to_execute] {
                if !seen.contains(&t) {
                    return Err(RoundError::UnknownPhase(t));
                }
            }
        }

        let mut phases = phases;
        let expanded_batch_size = phases
            .iter_mut()
            .map(|phase| phase.build(batch_size))
            .max()
            .unwrap_or(batch_size);

        let topology = Arc::new(topology);
        let buffer = Arc::new(RoundBuffer::new(
            Arc::clone(&env.group),
            batch_size,
            expanded_batch_size,
        ));
        let status = Arc::new(RoundStatus::new(id, env.on_error.clone()));

        let phases = phases
            .into_iter()
            .map(|phase| {
                phase.link(Arc::clone(&buffer));
                phase.bind(PhaseBinding {
                    round_id: id,
                    batch_size,
                    topology: Arc::clone(&topology),
                    status: Arc::clone(&status),
                    measure: Arc::clone(&env.measure),
                });
                (phase.phase_type(), Arc::new(phase))
            })
            .collect();

        tracing::info!(
            round_id = id,
            batch_size,
            expanded_batch_size,
            nodes = topology.len(),
            local_index = topology.local_index(),
            "round created"
        );

        Ok(Self {
            id,
            topology,
            batch_size,
            buffer,
            phases,
            responses,
            status,
        })
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn buffer(&self) -> &Arc<RoundBuffer> {
        &self.buffer
    }

    pub fn responses(&self) -> &ResponseMap {
        &self.responses
    }

    pub fn status(&self) -> &Arc<RoundStatus> {
        &self.status
    }

    pub fn is_first_node(&self) -> bool {
        self.topology.is_first_node()
    }

    pub fn is_last_node(&self) -> bool {
        self.topology.is_last_node()
    }

    pub fn phase(&self, phase_type: PhaseType) -> Result<&Arc<Phase>, RoundError> {
        self.phases
            .get(&phase_type)
            .ok_or(RoundError::UnknownPhase(phase_type))
    }

    pub fn phases(&self) -> impl Iterator<Item = &Arc<Phase>> {
        self.phases.values()
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    pub fn fail(&self, error: RoundError) -> bool {
        self.status.fail(error)
    }

    /// Resolve `tag` through the response map and drive the target phase.
    pub fn deliver(
        &self,
        tag: &str,
        event: Event,
        queue: &ResourceQueue,
    ) -> Result<(), RoundError> {
        if self.status.is_failed() {
            return Err(RoundError::AlreadyFailed(self.id));
        }
        let response = self
            .responses
            .get(tag)
            .ok_or_else(|| RoundError::UnknownTag(tag.to_string()))?;
        let source = self.phase(response.phase_at_source)?;
        let state = source.state();
        if !response.accepts(state) {
            return Err(RoundError::UnexpectedState {
                phase: response.phase_at_source,
                state,
                expected: response.expected_states.clone(),
            });
        }
        let target = self.phase(response.phase_to_execute)?;
        tracing::trace!(round_id = self.id, tag, phase = %target.phase_type(), "event delivered");

        match event {
            Event::Slots(slots) => {
                let chunk = Event::slot_range(&slots, self.batch_size)?;
                for slot in &slots {
                    target.input(slot.index, slot)?;
                }
                target.send(chunk);
                target.attempt_to_queue(queue);
            }
            Event::Start => {
                target.attempt_to_queue(queue);
            }
            Event::Verify => {
                let state = target.state();
                if state != PhaseState::Computed {
                    return Err(RoundError::UnexpectedState {
                        phase: target.phase_type(),
                        state,
                        expected: vec![PhaseState::Computed],
                    });
                }
                target.verify();
            }
        }
        Ok(())
    }

    /// Stop every phase graph and zero the round's secrets.
    pub fn close(&self, kill_timeout: Duration) {
        for phase in self.phases.values() {
            if !phase.graph().kill(kill_timeout) {
                tracing::warn!(
                    round_id = self.id,
                    phase = %phase.phase_type(),
                    "phase workers outlived kill"
                );
            }
        }
        self.buffer.erase();
    }
}

/// Live rounds by id. Lookups run concurrently; changes are serialized.
#[derive(Default)]
pub struct RoundManager {
    rounds: RwLock<HashMap<RoundId, Arc<Round>>>,
}

impl RoundManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, round: Arc<Round>) -> Result<(), RoundError> {
        let mut rounds = self.rounds.write();
        if rounds.contains_key(&round.id()) {
            return Err(RoundError::DuplicateRound(round.id()));
        }
        rounds.insert(round.id(), round);
        Ok(())
    }

    pub fn get(&self, id: RoundId) -> Option<Arc<Round>> {
        self.rounds.read().get(&id).cloned()
    }

    pub fn contains(&self, id: RoundId) -> bool {
        self.rounds.read().contains_key(&id)
    }

    pub fn remove(&self, id: RoundId) -> Option<Arc<Round>> {
        self.rounds.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.rounds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.read().is_empty()
    }

    pub fn ids(&self) -> Vec<RoundId> {
        let mut ids: Vec<_> = self.rounds.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphGenerator;
    use crate::group::tests::test_group;
    use crate::kernel::{FnKernel, Kernel};
    use crate::measure::NoMeasure;
    use crate::module::ModuleDef;
    use crate::phase::Drain;
    use crate::response::Response;
    use crate::stream::PayloadStream;
    use crate::topology::NodeId;

    fn env() -> RoundEnv {
        RoundEnv {
            group: Arc::new(test_group()),
            measure: Arc::new(NoMeasure),
            on_error: None,
        }
    }

    fn topology(local: &str) -> Topology {
        let nodes = ["n0", "n1", "n2"].into_iter().map(NodeId::new).collect();
        Topology::new(nodes, &NodeId::new(local)).unwrap()
    }

    fn phase(t: PhaseType) -> Phase {
        let k: Arc<dyn Kernel> = Arc::new(FnKernel::new("noop", |_s: &PayloadStream, _c| Ok(())));
        let mut g =
            GraphGenerator::new(1, 1, 0.0).new_graph(t.as_str(), Arc::new(PayloadStream::new()));
        let m = g.add_module(ModuleDef::new("m", k).assignment_size(4));
        g.first(m);
        g.last(m);
        Phase::new(t, g, Arc::new(Drain))
    }

    #[test]
    fn new_binds_and_links_every_phase() {
        let r = Round::new(
            7,
            topology("n0"),
            6,
            vec![phase(PhaseType::RealDecrypt), phase(PhaseType::RealPermute)],
            ResponseMap::new(),
            &env(),
        )
        .unwrap();
        assert!(r.is_first_node());
        assert!(!r.is_last_node());
        let p = r.phase(PhaseType::RealPermute).unwrap();
        assert_eq!(p.round_id(), Some(7));
        assert_eq!(p.graph().expanded_batch_size(), 8);
        assert_eq!(r.buffer().batch_size(), 6);
        assert_eq!(r.buffer().expanded_batch_size(), 8);
        assert_eq!(r.buffer().r.len(), 8);
        assert!(matches!(
            r.phase(PhaseType::PrecompShare),
            Err(RoundError::UnknownPhase(PhaseType::PrecompShare))
        ));
    }

    #[test]
    fn duplicate_phase_type_rejected() {
        let err = Round::new(
            1,
            topology("n2"),
            4,
            vec![phase(PhaseType::RealDecrypt), phase(PhaseType::RealDecrypt)],
            ResponseMap::new(),
            &env(),
        )
        .unwrap_err();
        assert_eq!(err, RoundError::DuplicatePhase(PhaseType::RealDecrypt));
    }

    #[test]
    fn response_to_missing_phase_rejected() {
        let responses = ResponseMap::new().with(
            "share",
            Response::own(PhaseType::PrecompShare, [PhaseState::Initialized]),
        );
        let phases = vec![phase(PhaseType::RealDecrypt)];
        let err = Round::new(1, topology("n1"), 4, phases, responses, &env()).unwrap_err();
        assert_eq!(err, RoundError::UnknownPhase(PhaseType::PrecompShare));
    }

    #[test]
    fn fail_reports_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let mut e = env();
        e.on_error = Some(Arc::new(move |id: RoundId, err: &RoundError| {
            sink.lock().push((id, err.clone()));
        }));
        let phases = vec![phase(PhaseType::RealDecrypt)];
        let r = Round::new(3, topology("n1"), 4, phases, ResponseMap::new(), &e).unwrap();
        assert!(r.fail(RoundError::NotInTopology));
        assert!(!r.fail(RoundError::NonContiguousSlots));
        assert_eq!(r.status().error(), Some(RoundError::NotInTopology));
        assert_eq!(*calls.lock(), vec![(3, RoundError::NotInTopology)]);
    }

    #[test]
    fn manager_rejects_duplicates() {
        let manager = RoundManager::new();
        let make = |id| {
            let phases = vec![phase(PhaseType::RealDecrypt)];
            Arc::new(Round::new(id, topology("n0"), 4, phases, ResponseMap::new(), &env()).unwrap())
        };
        manager.add(make(2)).unwrap();
        manager.add(make(1)).unwrap();
        assert_eq!(manager.add(make(2)), Err(RoundError::DuplicateRound(2)));
        assert_eq!(manager.ids(), vec![1, 2]);
        assert!(manager.get(1).is_some());
        assert_eq!(manager.remove(1).map(|r| r.id()), Some(1));
        assert!(manager.get(1).is_none());
        assert_eq!(manager.len(), 1);
    }
}
