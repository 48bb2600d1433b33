//! Completed-batch handoff from the last realtime phase to the gateway.

mod common;

use cmix_node::measure::NoMeasure;
use cmix_node::{
    BatchQueue, CompletedRound, Event, FinishRealtime, MixNode, ModuleDef, NodeConfig, NodeId,
    PayloadStream, PeerNotifier, Phase, PhaseState, PhaseType, QueueError, Response, ResponseMap,
    RoundError, RoundId, Slot, TransportError,
};
use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Records notifications and refuses the peers listed in `refuse`.
#[derive(Default)]
struct Peers {
    notified: Mutex<Vec<(NodeId, RoundId)>>,
    refuse: Vec<NodeId>,
}

impl PeerNotifier for Peers {
    fn notify_finished(&self, peer: &NodeId, round_id: RoundId) -> Result<(), TransportError> {
        if self.refuse.contains(peer) {
            return Err(TransportError::Peer {
                peer: peer.clone(),
                reason: "connection refused".into(),
            });
        }
        self.notified.lock().push((peer.clone(), round_id));
        Ok(())
    }
}

fn nodes() -> Vec<NodeId> {
    ["node-0", "node-1", "node-2"].into_iter().map(NodeId::new).collect()
}

fn config(completed_capacity: usize) -> NodeConfig {
    NodeConfig::builder()
        .default_num_threads(2)
        .min_slot_size(4)
        .completed_batch_capacity(completed_capacity)
        .phase_timeout(Duration::from_secs(5))
        .kill_timeout(Duration::from_millis(200))
        .build()
        .unwrap()
}

/// Node with one realtime round whose permute phase finishes the batch.
fn finishing_round(
    config: NodeConfig,
    peers: Arc<Peers>,
    batch_size: u32,
) -> (MixNode, Arc<cmix_node::Round>) {
    init_tracing();
    let node = MixNode::new(NodeId::new("node-2"), config, group(), Arc::new(NoMeasure)).unwrap();
    let mut g = node
        .graph_generator()
        .new_graph("finish", Arc::new(PayloadStream::new()));
    let m = g.add_module(ModuleDef::new("square", square()).assignment_size(4));
    g.first(m);
    g.last(m);
    let finish = FinishRealtime::new(Arc::clone(node.completed_batch_queue()), peers);
    let phase = Phase::new(PhaseType::RealPermute, g, Arc::new(finish));
    let responses = ResponseMap::new().with(
        "permute",
        Response::own(PhaseType::RealPermute, [PhaseState::Initialized, PhaseState::Active]),
    );
    let round = node
        .create_round(11, nodes(), batch_size, vec![phase], responses)
        .unwrap();
    (node, round)
}

fn deliver_all(node: &MixNode, batch_size: u32) {
    let slots: Vec<Slot> = (0..batch_size).map(|i| slot(i, i + 2)).collect();
    node.deliver(11, "permute", Event::Slots(slots)).unwrap();
}

#[test]
fn full_queue_rejects_third_batch() {
    let q = BatchQueue::new(2);
    for round_id in 1..=2 {
        q.send(CompletedRound {
            round_id,
            slots: Vec::new(),
        })
        .unwrap();
    }
    let third = q.send(CompletedRound {
        round_id: 3,
        slots: Vec::new(),
    });
    assert_eq!(third, Err(QueueError::Full));
    assert_eq!(q.len(), 2);
    assert_eq!(q.recv().map(|r| r.round_id), Some(1));
    assert_eq!(q.recv().map(|r| r.round_id), Some(2));
    assert!(q.recv().is_none());
}

#[test]
fn realtime_batch_reaches_gateway_once() {
    let peers = Arc::new(Peers::default());
    let (node, round) = finishing_round(config(4), Arc::clone(&peers), 6);
    assert!(round.is_last_node());
    deliver_all(&node, 6);

    let permute = round.phase(PhaseType::RealPermute).unwrap();
    wait_for("permute verified", || permute.state() == PhaseState::Verified);

    let completed = node.completed_batch_queue().recv().expect("one completed batch");
    assert!(node.completed_batch_queue().recv().is_none());
    assert_eq!(completed.round_id, 11);
    assert_eq!(completed.slots.len(), 6);
    let squared: Vec<Slot> = (0..6).map(|i| slot(i, (i + 2) * (i + 2))).collect();
    for (got, want) in completed.slots.iter().zip(&squared) {
        assert_eq!(got.index, want.index);
        assert_eq!(got.payload_a, want.payload_a);
    }

    let mut notified = peers.notified.lock().clone();
    notified.sort();
    assert_eq!(
        notified,
        vec![(NodeId::new("node-0"), 11), (NodeId::new("node-1"), 11)]
    );
    assert!(!round.is_failed());
    node.shutdown();
}

#[test]
fn full_gateway_queue_fails_round() {
    let peers = Arc::new(Peers::default());
    let (node, round) = finishing_round(config(1), Arc::clone(&peers), 8);
    node.completed_batch_queue()
        .send(CompletedRound {
            round_id: 10,
            slots: Vec::new(),
        })
        .unwrap();
    deliver_all(&node, 8);

    wait_for("round failure", || round.is_failed());
    assert_eq!(
        round.status().error(),
        Some(RoundError::Transport(TransportError::Queue(QueueError::Full)))
    );
    assert_eq!(node.completed_batch_queue().len(), 1);
    assert!(peers.notified.lock().is_empty());
    node.shutdown();
}

#[test]
fn peer_failures_are_aggregated() {
    let peers = Arc::new(Peers {
        refuse: vec![NodeId::new("node-1")],
        ..Peers::default()
    });
    let (node, round) = finishing_round(config(4), Arc::clone(&peers), 8);
    deliver_all(&node, 8);

    wait_for("round failure", || round.is_failed());
    let Some(RoundError::Transport(TransportError::Aggregate(errors))) = round.status().error()
    else {
        panic!("expected aggregated transport error");
    };
    assert_eq!(
        errors,
        vec![TransportError::Peer {
            peer: NodeId::new("node-1"),
            reason: "connection refused".into(),
        }]
    );
    assert_eq!(*peers.notified.lock(), vec![(NodeId::new("node-0"), 11)]);
    // The gateway already holds the batch; only the notification failed.
    assert_eq!(node.completed_batch_queue().len(), 1);
    let permute = round.phase(PhaseType::RealPermute).unwrap();
    wait_for("phase error", || permute.state() == PhaseState::Error);
    node.shutdown();
}

#[test]
fn batch_requests_are_bounded() {
    init_tracing();
    let node = MixNode::new(
        NodeId::new("node-0"),
        NodeConfig::builder()
            .request_batch_capacity(1)
            .build()
            .unwrap(),
        group(),
        Arc::new(NoMeasure),
    )
    .unwrap();
    let requests = node.request_new_batch_queue();
    requests
        .send(cmix_node::BatchRequest {
            round_id: 1,
            batch_size: 8,
        })
        .unwrap();
    assert_eq!(
        requests.send(cmix_node::BatchRequest {
            round_id: 2,
            batch_size: 8,
        }),
        Err(QueueError::Full)
    );
    assert_eq!(requests.recv().map(|r| r.round_id), Some(1));
    node.shutdown();
}
