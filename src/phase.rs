//! Phases: one stage of a round, a graph plus its lifecycle and transmission.
//!
//! The lifecycle is a CAS-driven state machine:
//!
//! ```text
//! initialized -> active -> computed -> verified
//!                       \------------> verified
//! ```
//!
//! `active -> computed` is taken by phases that need a peer verification
//! before they count as done. Any non-verified state may fail into `error`.
//! A failed phase absorbs further transitions; every other illegal edge is
//! a fatal fault.

use crate::chunk::Chunk;
use crate::error::{StreamError, TransportError};
use crate::graph::Graph;
use crate::invariant_ppt::{assert_invariant, ILLEGAL_TRANSITION, PHASE_REBIND};
use crate::measure::{self, Measure};
use crate::resource_queue::ResourceQueue;
use crate::round::{RoundId, RoundStatus};
use crate::round_buffer::RoundBuffer;
use crate::stream::Slot;
use crate::topology::Topology;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

/// Which stage of a round a phase computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum PhaseType {
    PrecompGeneration = 0,
    PrecompShare,
    PrecompDecrypt,
    PrecompPermute,
    PrecompReveal,
    RealDecrypt,
    RealPermute,
    Complete,
    Error,
}

pub const NUM_PHASES: usize = PhaseType::Error as usize + 1;

const TYPE_STRINGS: [&str; NUM_PHASES] = [
    "PrecompGeneration",
    "PrecompShare",
    "PrecompDecrypt",
    "PrecompPermute",
    "PrecompReveal",
    "RealDecrypt",
    "RealPermute",
    "Complete",
    "Error",
];

impl PhaseType {
    pub const ALL: [PhaseType; NUM_PHASES] = [
        PhaseType::PrecompGeneration,
        PhaseType::PrecompShare,
        PhaseType::PrecompDecrypt,
        PhaseType::PrecompPermute,
        PhaseType::PrecompReveal,
        PhaseType::RealDecrypt,
        PhaseType::RealPermute,
        PhaseType::Complete,
        PhaseType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        TYPE_STRINGS[self as usize]
    }

    pub fn is_precomputation(self) -> bool {
        self <= PhaseType::PrecompReveal
    }

    pub fn is_realtime(self) -> bool {
        matches!(self, PhaseType::RealDecrypt | PhaseType::RealPermute)
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum PhaseState {
    Initialized = 0,
    Active = 1,
    Computed = 2,
    Verified = 3,
    Error = 4,
}

impl PhaseState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => PhaseState::Initialized,
            1 => PhaseState::Active,
            2 => PhaseState::Computed,
            3 => PhaseState::Verified,
            _ => PhaseState::Error,
        }
    }

    /// Legal edges of the lifecycle.
    pub fn can_transition_to(self, to: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, to),
            (Initialized, Active)
                | (Active, Computed)
                | (Active, Verified)
                | (Computed, Verified)
                | (Initialized | Active | Computed, Error)
        )
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseState::Initialized => "initialized",
            PhaseState::Active => "active",
            PhaseState::Computed => "computed",
            PhaseState::Verified => "verified",
            PhaseState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything a transmission handler may read while a phase runs.
pub struct TransmitContext<'a> {
    pub round_id: RoundId,
    pub phase_type: PhaseType,
    pub topology: &'a Topology,
    pub batch_size: u32,
    graph: &'a Graph,
}

impl<'a> TransmitContext<'a> {
    pub(crate) fn new(phase: &'a Phase, binding: &'a PhaseBinding) -> Self {
        Self {
            round_id: binding.round_id,
            phase_type: phase.phase_type,
            topology: &binding.topology,
            batch_size: binding.batch_size,
            graph: &phase.graph,
        }
    }

    /// Next finished chunk; `None` once the output sink has closed.
    pub fn next_chunk(&self) -> Option<Chunk> {
        self.graph.get_output()
    }

    /// Serialized slot `index` of the phase's stream.
    pub fn message(&self, index: u32) -> Result<Slot, StreamError> {
        self.graph.stream().output(index)
    }

    /// True iff the sink closed because every slot finished.
    pub fn output_complete(&self) -> bool {
        self.graph.is_complete()
    }
}

/// Sends a phase's output wherever it goes next.
///
/// Runs on its own thread while the graph computes and returns once the
/// output sink has closed.
pub trait Transmitter: Send + Sync {
    fn transmit(&self, ctx: &TransmitContext<'_>) -> Result<(), TransportError>;
}

/// Transmitter that consumes the output and sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Drain;

impl Transmitter for Drain {
    fn transmit(&self, ctx: &TransmitContext<'_>) -> Result<(), TransportError> {
        while ctx.next_chunk().is_some() {}
        Ok(())
    }
}

/// The round a phase belongs to. Set once, when the round is created.
pub(crate) struct PhaseBinding {
    pub(crate) round_id: RoundId,
    pub(crate) batch_size: u32,
    pub(crate) topology: Arc<Topology>,
    pub(crate) status: Arc<RoundStatus>,
    pub(crate) measure: Arc<dyn Measure>,
}

pub struct Phase {
    phase_type: PhaseType,
    graph: Graph,
    transmitter: Arc<dyn Transmitter>,
    timeout: Option<Duration>,
    verification: bool,
    state: AtomicU32,
    queued: AtomicU32,
    received: AtomicBool,
    binding: OnceLock<PhaseBinding>,
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("type", &self.phase_type)
            .field("state", &self.state())
            .field("queued", &self.is_queued())
            .field("round_id", &self.round_id())
            .field("graph", &self.graph.name())
            .finish()
    }
}

impl Phase {
    pub fn new(phase_type: PhaseType, graph: Graph, transmitter: Arc<dyn Transmitter>) -> Self {
        Self {
            phase_type,
            graph,
            transmitter,
            timeout: None,
            verification: false,
            state: AtomicU32::new(PhaseState::Initialized as u32),
            queued: AtomicU32::new(0),
            received: AtomicBool::new(false),
            binding: OnceLock::new(),
        }
    }

    /// Override the node's default phase timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Finish in `computed` and wait for a peer's verification.
    pub fn with_verification(mut self) -> Self {
        self.verification = true;
        self
    }

    pub fn phase_type(&self) -> PhaseType {
        self.phase_type
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn requires_verification(&self) -> bool {
        self.verification
    }

    pub fn transmitter(&self) -> &Arc<dyn Transmitter> {
        &self.transmitter
    }

    pub fn state(&self) -> PhaseState {
        PhaseState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire) == 1
    }

    pub fn round_id(&self) -> Option<RoundId> {
        self.binding.get().map(|b| b.round_id)
    }

    pub(crate) fn binding(&self) -> Option<&PhaseBinding> {
        self.binding.get()
    }

    /// Build the graph for a round and return its expanded batch size.
    pub(crate) fn build(&mut self, batch_size: u32) -> u32 {
        self.graph.build(batch_size);
        self.graph.expanded_batch_size()
    }

    pub(crate) fn link(&self, buffer: Arc<RoundBuffer>) {
        self.graph.link(buffer);
    }

    pub(crate) fn bind(&self, binding: PhaseBinding) {
        let round_id = binding.round_id;
        let bound = self.binding.set(binding).is_ok();
        let context = format!("{} for round {}", self.phase_type, round_id);
        assert_invariant(
            PHASE_REBIND,
            bound,
            "phase bound to a second round",
            Some(context.as_str()),
        );
    }

    /// Move to `to`. Returns false if the phase had already failed.
    fn transition(&self, to: PhaseState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = PhaseState::from_u32(current);
            if from == PhaseState::Error {
                return false;
            }
            if !from.can_transition_to(to) {
                let context = format!("{}: {} -> {}", self.phase_type, from, to);
                assert_invariant(
                    ILLEGAL_TRANSITION,
                    false,
                    "illegal phase transition",
                    Some(context.as_str()),
                );
            }
            match self.state.compare_exchange(
                current,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// `initialized -> active`, when the phase is selected to run.
    pub fn activate(&self) -> bool {
        self.transition(PhaseState::Active)
    }

    /// Record graph completion: `computed` if verification is declared,
    /// otherwise straight to `verified`.
    pub fn finalize(&self) -> bool {
        let to = if self.verification {
            PhaseState::Computed
        } else {
            PhaseState::Verified
        };
        let moved = self.transition(to);
        if moved && to == PhaseState::Verified {
            self.measure(measure::VERIFICATION);
        }
        moved
    }

    /// `computed -> verified`, on a peer's verification message.
    pub fn verify(&self) -> bool {
        let moved = self.transition(PhaseState::Verified);
        if moved {
            self.measure(measure::VERIFICATION);
        }
        moved
    }

    /// Move to the error terminal. False if already failed or verified.
    pub fn fail(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !PhaseState::from_u32(current).can_transition_to(PhaseState::Error) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                PhaseState::Error as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Queue this phase for execution. Only the first caller succeeds.
    pub fn attempt_to_queue(self: &Arc<Self>, queue: &ResourceQueue) -> bool {
        if self
            .queued
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(round_id = ?self.round_id(), phase = %self.phase_type, "phase queued");
        queue.push(Arc::clone(self))
    }

    /// Decode a wire slot into the phase's stream.
    pub fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        self.graph.stream().input(index, slot)
    }

    /// Hand a chunk of received slots to the graph.
    ///
    /// The chunk ending at the round's batch size also feeds the padding
    /// slots up to the expanded batch size. Returns true once every input
    /// slot has arrived.
    pub fn send(&self, chunk: Chunk) -> bool {
        if !self.received.swap(true, Ordering::AcqRel) {
            self.measure(measure::FIRST_SLOT_RECEIVED);
        }
        let mut done = self.graph.send(chunk);

        let expanded = self.graph.expanded_batch_size();
        let batch = self.binding.get().map_or(expanded, |b| b.batch_size);
        if chunk.end() == batch && expanded > batch {
            done = self.graph.send(Chunk::new(batch, expanded));
        }
        if done {
            self.measure(measure::LAST_SLOT_RECEIVED);
        }
        done
    }

    pub(crate) fn measure(&self, tag: &'static str) {
        if let Some(b) = self.binding.get() {
            b.measure.measure(b.round_id, self.phase_type, tag, SystemTime::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphGenerator;
    use crate::kernel::{FnKernel, Kernel};
    use crate::module::ModuleDef;
    use crate::stream::PayloadStream;
    use std::thread;

    fn phase(verification: bool) -> Phase {
        let k: Arc<dyn Kernel> = Arc::new(FnKernel::new("noop", |_s: &PayloadStream, _c| Ok(())));
        let mut g = GraphGenerator::new(1, 1, 0.0).new_graph("p", Arc::new(PayloadStream::new()));
        let m = g.add_module(ModuleDef::new("m", k));
        g.first(m);
        g.last(m);
        let p = Phase::new(PhaseType::RealDecrypt, g, Arc::new(Drain));
        if verification {
            p.with_verification()
        } else {
            p
        }
    }

    #[test]
    fn type_strings_cover_every_phase() {
        assert_eq!(NUM_PHASES, 9);
        for (i, t) in PhaseType::ALL.iter().enumerate() {
            assert_eq!(*t as usize, i);
        }
        assert_eq!(PhaseType::Complete.to_string(), "Complete");
        assert_eq!(PhaseType::Error.to_string(), "Error");
        assert!(PhaseType::PrecompReveal.is_precomputation());
        assert!(!PhaseType::RealDecrypt.is_precomputation());
    }

    #[test]
    fn single_step_finalization() {
        let p = phase(false);
        assert!(p.activate());
        assert!(p.finalize());
        assert_eq!(p.state(), PhaseState::Verified);
        assert!(!p.fail());
    }

    #[test]
    fn two_step_finalization() {
        let p = phase(true);
        p.activate();
        p.finalize();
        assert_eq!(p.state(), PhaseState::Computed);
        assert!(p.verify());
        assert_eq!(p.state(), PhaseState::Verified);
    }

    #[test]
    #[should_panic(expected = "ILLEGAL_TRANSITION")]
    fn initialized_to_verified_is_fatal() {
        phase(false).verify();
    }

    #[test]
    #[should_panic(expected = "ILLEGAL_TRANSITION")]
    fn double_activation_is_fatal() {
        let p = phase(false);
        p.activate();
        p.activate();
    }

    #[test]
    fn failed_phase_absorbs_transitions() {
        let p = phase(true);
        p.activate();
        assert!(p.fail());
        assert!(!p.fail());
        assert!(!p.finalize());
        assert!(!p.verify());
        assert_eq!(p.state(), PhaseState::Error);
    }

    #[test]
    fn legal_edges_are_monotone() {
        for from in [
            PhaseState::Initialized,
            PhaseState::Active,
            PhaseState::Computed,
            PhaseState::Verified,
        ] {
            for to in [
                PhaseState::Initialized,
                PhaseState::Active,
                PhaseState::Computed,
                PhaseState::Verified,
            ] {
                if from.can_transition_to(to) {
                    assert!(from < to, "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn concurrent_failure_has_one_winner() {
        let p = Arc::new(phase(false));
        p.state.store(PhaseState::Active as u32, Ordering::Release);
        let winners: u32 = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || p.fail() as u32)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }
}
