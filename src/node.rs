//! The mix node: round lifecycle, event delivery and gateway queues.

use crate::batch_queue::{BatchQueue, BatchRequest, CompletedRound};
use crate::config::NodeConfig;
use crate::error::{NodeError, RoundError};
use crate::graph::GraphGenerator;
use crate::group::CyclicGroup;
use crate::measure::Measure;
use crate::phase::Phase;
use crate::resource_queue::ResourceQueue;
use crate::response::{Event, ResponseMap};
use crate::round::{Round, RoundEnv, RoundErrorHandler, RoundId, RoundManager};
use crate::topology::{NodeId, Topology};
use std::sync::Arc;

pub struct MixNode {
    id: NodeId,
    config: NodeConfig,
    env: RoundEnv,
    rounds: RoundManager,
    resource_queue: ResourceQueue,
    completed: Arc<BatchQueue<CompletedRound>>,
    requests: Arc<BatchQueue<BatchRequest>>,
}

impl MixNode {
    pub fn new(
        id: NodeId,
        config: NodeConfig,
        group: Arc<CyclicGroup>,
        measure: Arc<dyn Measure>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let resource_queue = ResourceQueue::new(config.queue_settings())?;
        tracing::info!(node = %id, threads = config.default_num_threads, "mix node started");
        Ok(Self {
            id,
            env: RoundEnv {
                group,
                measure,
                on_error: None,
            },
            rounds: RoundManager::new(),
            resource_queue,
            completed: Arc::new(BatchQueue::new(config.completed_batch_capacity)),
            requests: Arc::new(BatchQueue::new(config.request_batch_capacity)),
            config,
        })
    }

    /// Callback for every round failure. Applies to rounds created afterwards.
    pub fn with_error_handler(mut self, handler: RoundErrorHandler) -> Self {
        self.env.on_error = Some(handler);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Generator configured for this node's phase graphs.
    pub fn graph_generator(&self) -> GraphGenerator {
        GraphGenerator::new(
            self.config.min_slot_size,
            self.config.default_num_threads,
            self.config.output_threshold,
        )
    }

    pub fn rounds(&self) -> &RoundManager {
        &self.rounds
    }

    pub fn create_round(
        &self,
        round_id: RoundId,
        nodes: Vec<NodeId>,
        batch_size: u32,
        phases: Vec<Phase>,
        responses: ResponseMap,
    ) -> Result<Arc<Round>, RoundError> {
        if self.rounds.contains(round_id) {
            return Err(RoundError::DuplicateRound(round_id));
        }
        let topology = Topology::new(nodes, &self.id).ok_or(RoundError::NotInTopology)?;
        let round = Arc::new(Round::new(
            round_id, topology, batch_size, phases, responses, &self.env,
        )?);
        self.rounds.add(Arc::clone(&round))?;
        Ok(round)
    }

    pub fn get_round(&self, round_id: RoundId) -> Option<Arc<Round>> {
        self.rounds.get(round_id)
    }

    /// Remove a round, stop its graphs and erase its buffer.
    pub fn drop_round(&self, round_id: RoundId) -> Result<Arc<Round>, RoundError> {
        let round = self
            .rounds
            .remove(round_id)
            .ok_or(RoundError::UnknownRound(round_id))?;
        round.close(self.config.kill_timeout);
        tracing::info!(round_id, failed = round.is_failed(), "round dropped");
        Ok(round)
    }

    /// Route a tagged network event to a round.
    pub fn deliver(&self, round_id: RoundId, tag: &str, event: Event) -> Result<(), RoundError> {
        let round = self
            .rounds
            .get(round_id)
            .ok_or(RoundError::UnknownRound(round_id))?;
        round.deliver(tag, event, &self.resource_queue)
    }

    pub fn resource_queue(&self) -> &ResourceQueue {
        &self.resource_queue
    }

    pub fn completed_batch_queue(&self) -> &Arc<BatchQueue<CompletedRound>> {
        &self.completed
    }

    pub fn request_new_batch_queue(&self) -> &Arc<BatchQueue<BatchRequest>> {
        &self.requests
    }

    /// Drop every round, then drain the resource queue.
    pub fn shutdown(&self) {
        for id in self.rounds.ids() {
            let _ = self.drop_round(id);
        }
        self.resource_queue.shutdown();
        tracing::info!(node = %self.id, "mix node stopped");
    }
}
