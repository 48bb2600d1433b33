//! Topology: the ordered ring of nodes cooperating on a round.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Peers of a round in processing order, and where this node sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    nodes: Vec<NodeId>,
    local: usize,
}

impl Topology {
    /// Returns `None` when `local` is not one of `nodes`.
    pub fn new(nodes: Vec<NodeId>, local: &NodeId) -> Option<Self> {
        let local = nodes.iter().position(|n| n == local)?;
        Some(Self { nodes, local })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn local_index(&self) -> usize {
        self.local
    }

    pub fn local_node(&self) -> &NodeId {
        &self.nodes[self.local]
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n == id)
    }

    pub fn node_at(&self, index: usize) -> Option<&NodeId> {
        self.nodes.get(index)
    }

    /// Node after the local one, wrapping from the last back to the first.
    pub fn next_node(&self) -> &NodeId {
        &self.nodes[(self.local + 1) % self.nodes.len()]
    }

    /// Node before the local one, wrapping from the first to the last.
    pub fn prev_node(&self) -> &NodeId {
        let n = self.nodes.len();
        &self.nodes[(self.local + n - 1) % n]
    }

    pub fn is_first_node(&self) -> bool {
        self.local == 0
    }

    pub fn is_last_node(&self) -> bool {
        self.local + 1 == self.nodes.len()
    }

    /// Every node except the local one.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.local)
            .map(|(_, n)| n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(local: &str) -> Topology {
        let nodes = ["a", "b", "c"].into_iter().map(NodeId::new).collect();
        Topology::new(nodes, &NodeId::new(local)).unwrap()
    }

    #[test]
    fn neighbours_wrap_at_both_ends() {
        let first = ring("a");
        assert!(first.is_first_node());
        assert_eq!(first.prev_node(), &NodeId::new("c"));
        assert_eq!(first.next_node(), &NodeId::new("b"));

        let last = ring("c");
        assert!(last.is_last_node());
        assert_eq!(last.next_node(), &NodeId::new("a"));
        assert_eq!(last.prev_node(), &NodeId::new("b"));
    }

    #[test]
    fn lookup_and_peers() {
        let t = ring("b");
        assert_eq!(t.index_of(&NodeId::new("c")), Some(2));
        assert_eq!(t.node_at(3), None);
        assert_eq!(t.local_node().as_str(), "b");
        let peers: Vec<_> = t.peers().map(NodeId::as_str).collect();
        assert_eq!(peers, vec!["a", "c"]);
    }

    #[test]
    fn local_must_be_a_member() {
        assert!(Topology::new(vec![NodeId::new("a")], &NodeId::new("z")).is_none());
    }

    #[test]
    fn single_node_is_first_and_last() {
        let t = Topology::new(vec![NodeId::new("solo")], &NodeId::new("solo")).unwrap();
        assert!(t.is_first_node() && t.is_last_node());
        assert_eq!(t.prev_node(), t.next_node());
    }
}
