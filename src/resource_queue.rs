//! Resource queue: runs queued phases one at a time on a single consumer.
//!
//! For each phase the consumer activates it, starts its graph and its
//! transmitter, then waits for the transmitter to finish or the phase
//! timeout to expire. Success finalizes the phase; any failure kills the
//! graph, moves the phase to `error` and fails the round.

use crate::error::{RoundError, TransportError};
use crate::measure;
use crate::phase::{Phase, TransmitContext};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Timeouts applied by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Used for phases without their own timeout.
    pub phase_timeout: Duration,
    /// How long to wait for graph workers to stop after a failure.
    pub kill_timeout: Duration,
}

pub struct ResourceQueue {
    tx: Mutex<Option<Sender<Arc<Phase>>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceQueue {
    /// Spawn the consumer thread.
    pub fn new(settings: QueueSettings) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let consumer = thread::Builder::new()
            .name("resource-queue".into())
            .spawn(move || consume(rx, settings))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Enqueue a phase. False once the queue has shut down.
    pub fn push(&self, phase: Arc<Phase>) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(phase).is_ok(),
            None => {
                tracing::warn!(phase = %phase.phase_type(), "resource queue closed, phase dropped");
                false
            }
        }
    }

    /// Stop accepting phases, finish those already queued and join the
    /// consumer.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("resource queue consumer panicked");
            }
        }
    }
}

impl Drop for ResourceQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consume(rx: Receiver<Arc<Phase>>, settings: QueueSettings) {
    for phase in rx.iter() {
        run_phase(&phase, &settings);
    }
    tracing::debug!("resource queue drained");
}

fn run_phase(phase: &Arc<Phase>, settings: &QueueSettings) {
    let phase_type = phase.phase_type();
    let Some(binding) = phase.binding() else {
        tracing::error!(phase = %phase_type, "unbound phase queued, skipping");
        return;
    };
    let round_id = binding.round_id;
    if binding.status.is_failed() {
        tracing::debug!(round_id, phase = %phase_type, "round failed, skipping phase");
        phase.fail();
        return;
    }
    if !phase.activate() {
        tracing::debug!(round_id, phase = %phase_type, "phase already failed");
        return;
    }
    tracing::debug!(round_id, phase = %phase_type, "phase activated");

    let fail = |error: RoundError| {
        if !phase.graph().kill(settings.kill_timeout) {
            tracing::warn!(round_id, phase = %phase_type, "graph workers outlived kill timeout");
        }
        phase.fail();
        binding.status.fail(error);
    };

    if let Err(e) = phase.graph().run() {
        fail(RoundError::Spawn {
            phase: phase_type,
            reason: e.to_string(),
        });
        return;
    }

    let (done_tx, done_rx) = bounded(1);
    let transmitting = Arc::clone(phase);
    let spawned = thread::Builder::new()
        .name(format!("transmit-{}-{}", round_id, phase_type))
        .spawn(move || transmit(transmitting, done_tx));
    let transmitter = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            fail(RoundError::Spawn {
                phase: phase_type,
                reason: e.to_string(),
            });
            return;
        }
    };

    let timeout = phase.timeout().unwrap_or(settings.phase_timeout);
    let outcome = match done_rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(RoundError::from),
        Err(RecvTimeoutError::Timeout) => Err(RoundError::Timeout {
            phase: phase_type,
            after: timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(RoundError::Terminated(phase_type)),
    };
    // A kernel failure closes the sink early, so it outranks whatever the
    // transmitter saw.
    let outcome = match phase.graph().error() {
        Some(failure) => Err(RoundError::Kernel {
            module: failure.module,
            source: failure.error,
        }),
        None if outcome.is_ok() && !phase.graph().is_complete() => {
            Err(RoundError::Terminated(phase_type))
        }
        None => outcome,
    };

    match outcome {
        Ok(()) => {
            phase.measure(measure::LAST_SLOT_TRANSMITTED);
            phase.finalize();
            phase.graph().wait();
            if transmitter.join().is_err() {
                tracing::error!(round_id, phase = %phase_type, "transmitter panicked");
            }
            tracing::debug!(
                round_id,
                phase = %phase_type,
                state = %phase.state(),
                "phase finished"
            );
        }
        Err(error) => {
            tracing::warn!(round_id, phase = %phase_type, %error, "phase failed");
            fail(error);
        }
    }
}

fn transmit(phase: Arc<Phase>, done: Sender<Result<(), TransportError>>) {
    let Some(binding) = phase.binding() else {
        return;
    };
    let ctx = TransmitContext::new(&phase, binding);
    let result = phase.transmitter().transmit(&ctx);
    let _ = done.send(result);
}
