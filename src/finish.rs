//! Finish-realtime collector: the transmitter of the last realtime phase.
//!
//! It gathers every finished slot into a [`CompletedRound`], hands it to the
//! gateway through the completed-batch queue and tells every peer the round
//! is done.

use crate::batch_queue::{BatchQueue, CompletedRound};
use crate::error::TransportError;
use crate::phase::{TransmitContext, Transmitter};
use crate::round::RoundId;
use crate::stream::Slot;
use crate::topology::NodeId;
use std::sync::Arc;
use std::thread;

/// Tells a peer that a round has finished.
pub trait PeerNotifier: Send + Sync {
    fn notify_finished(&self, peer: &NodeId, round_id: RoundId) -> Result<(), TransportError>;
}

pub struct FinishRealtime {
    completed: Arc<BatchQueue<CompletedRound>>,
    notifier: Arc<dyn PeerNotifier>,
}

impl FinishRealtime {
    pub fn new(
        completed: Arc<BatchQueue<CompletedRound>>,
        notifier: Arc<dyn PeerNotifier>,
    ) -> Self {
        Self {
            completed,
            notifier,
        }
    }

    fn broadcast(&self, ctx: &TransmitContext<'_>) -> Result<(), TransportError> {
        let errors: Vec<TransportError> = thread::scope(|s| {
            let handles: Vec<_> = ctx
                .topology
                .peers()
                .map(|peer| s.spawn(move || self.notifier.notify_finished(peer, ctx.round_id)))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| match h.join() {
                    Ok(result) => result.err(),
                    Err(_) => Some(TransportError::Peer {
                        peer: ctx.topology.local_node().clone(),
                        reason: "notifier panicked".into(),
                    }),
                })
                .collect()
        });
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Aggregate(errors))
        }
    }
}

impl Transmitter for FinishRealtime {
    fn transmit(&self, ctx: &TransmitContext<'_>) -> Result<(), TransportError> {
        let batch_size = ctx.batch_size;
        let mut slots = vec![Slot::default(); batch_size as usize];
        while let Some(chunk) = ctx.next_chunk() {
            for index in chunk.range().filter(|&i| i < batch_size) {
                slots[index as usize] = ctx.message(index)?;
            }
        }
        if !ctx.output_complete() {
            return Err(TransportError::Incomplete {
                round_id: ctx.round_id,
            });
        }

        let round = CompletedRound {
            round_id: ctx.round_id,
            slots,
        };
        if let Err(e) = self.completed.send(round) {
            tracing::warn!(round_id = ctx.round_id, error = %e, "completed batch dropped");
            return Err(e.into());
        }
        tracing::info!(round_id = ctx.round_id, batch_size, "realtime batch completed");

        self.broadcast(ctx)
    }
}
