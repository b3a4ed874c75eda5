//! DHT routing table module
//!
//! Kademlia routing table: 160 buckets indexed by the first bit in which a
//! node id differs from ours, at most `K` nodes each.

use crate::dht::node::{NodeId, NodeSession, NodeStatus};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::trace;

/// Kademlia constant - number of nodes per bucket
pub const K: usize = 8;

/// Result of offering a node to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The node was new and the bucket had room
    Added,
    /// The node was already known; its session was refreshed
    Updated,
    /// The bucket was full and a silent node made room
    Replaced(NodeId),
    /// The bucket was full of healthy nodes
    Rejected,
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in this bucket
    pub nodes: Vec<NodeSession>,
    /// When this bucket was last modified
    pub last_changed: Instant,
}

impl KBucket {
    /// Create a new KBucket
    pub fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(K),
            last_changed: Instant::now(),
        }
    }

    /// Add or refresh a node
    ///
    /// A full bucket only accepts a node that has just responded, and only
    /// by evicting a node that has gone silent or keeps failing.
    pub fn insert(&mut self, node: NodeSession) -> InsertOutcome {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id) {
            existing.addr = node.addr;
            if node.status == NodeStatus::Available {
                existing.mark_responded();
            }
            self.last_changed = Instant::now();
            return InsertOutcome::Updated;
        }

        if self.nodes.len() < K {
            self.nodes.push(node);
            self.last_changed = Instant::now();
            return InsertOutcome::Added;
        }

        if node.status != NodeStatus::Available {
            return InsertOutcome::Rejected;
        }

        let victim = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_evictable())
            .max_by_key(|(_, n)| (n.failed_queries, n.time_since_seen()))
            .map(|(i, _)| i);

        match victim {
            Some(index) => {
                let evicted = std::mem::replace(&mut self.nodes[index], node);
                self.last_changed = Instant::now();
                InsertOutcome::Replaced(evicted.id)
            }
            None => InsertOutcome::Rejected,
        }
    }

    /// Remove a node from the bucket
    pub fn remove_node(&mut self, id: &NodeId) -> Option<NodeSession> {
        let index = self.nodes.iter().position(|n| n.id == *id)?;
        self.last_changed = Instant::now();
        Some(self.nodes.remove(index))
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &NodeId) -> Option<&NodeSession> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    fn find_node_mut(&mut self, id: &NodeId) -> Option<&mut NodeSession> {
        self.nodes.iter_mut().find(|n| n.id == *id)
    }

    /// Get the number of nodes in the bucket
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    /// Our node ID
    pub our_id: NodeId,
    /// K buckets (160 buckets for 160-bit IDs)
    pub buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            buckets: (0..160).map(|_| KBucket::new()).collect(),
        }
    }

    /// Offer a node to the table
    pub fn insert(&mut self, node: NodeSession) -> InsertOutcome {
        if node.id == self.our_id {
            return InsertOutcome::Rejected;
        }
        let bucket_index = self.get_bucket_index(&node.id);
        let outcome = self.buckets[bucket_index].insert(node);
        trace!("Routing table insert into bucket {}: {:?}", bucket_index, outcome);
        outcome
    }

    /// Record a node that has just sent us a message
    pub fn record_response(&mut self, id: NodeId, addr: SocketAddr) -> InsertOutcome {
        self.insert(NodeSession::responded(id, addr))
    }

    /// Record a node learned from a compact node list
    pub fn record_candidate(&mut self, id: NodeId, addr: SocketAddr) -> InsertOutcome {
        self.insert(NodeSession::new(id, addr))
    }

    /// Record a node that sent us a query. Only a completed round trip
    /// makes a node good, so an unknown sender enters as a candidate and a
    /// known one keeps its status and failure count.
    pub fn record_query(&mut self, id: NodeId, addr: SocketAddr) -> InsertOutcome {
        let bucket_index = self.get_bucket_index(&id);
        if let Some(node) = self.buckets[bucket_index].find_node_mut(&id) {
            node.addr = addr;
            node.last_activity = Instant::now();
            return InsertOutcome::Updated;
        }
        self.record_candidate(id, addr)
    }

    /// Increment the failure counter of a node whose query timed out
    pub fn record_failure(&mut self, id: &NodeId) {
        let bucket_index = self.get_bucket_index(id);
        if let Some(node) = self.buckets[bucket_index].find_node_mut(id) {
            node.mark_failed();
        }
    }

    /// Mark a node as having an outstanding query
    pub fn mark_verifying(&mut self, id: &NodeId) {
        let bucket_index = self.get_bucket_index(id);
        if let Some(node) = self.buckets[bucket_index].find_node_mut(id) {
            node.mark_verifying();
        }
    }

    /// Up to `k` nodes sorted by ascending XOR distance to `target`,
    /// ties broken by id byte order
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<NodeSession> {
        let mut all_nodes: Vec<&NodeSession> = self.buckets.iter().flat_map(|b| b.nodes.iter()).collect();
        all_nodes.sort_by(|a, b| {
            a.distance_to(target)
                .cmp(&b.distance_to(target))
                .then_with(|| a.id.cmp(&b.id))
        });
        all_nodes.into_iter().take(k).cloned().collect()
    }

    /// Find K closest nodes to a target ID
    pub fn find_closest_nodes(&self, target: &NodeId) -> Vec<NodeSession> {
        self.find_closest(target, K)
    }

    /// Remove a node from the routing table
    pub fn remove_node(&mut self, id: &NodeId) -> Option<NodeSession> {
        let bucket_index = self.get_bucket_index(id);
        self.buckets[bucket_index].remove_node(id)
    }

    /// Get all nodes in the routing table
    pub fn get_nodes(&self) -> Vec<NodeSession> {
        self.buckets.iter().flat_map(|b| b.nodes.clone()).collect()
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &NodeId) -> Option<&NodeSession> {
        let bucket_index = self.get_bucket_index(id);
        self.buckets[bucket_index].find_node(id)
    }

    /// Find a node by address
    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&NodeSession> {
        self.buckets.iter().flat_map(|b| b.nodes.iter()).find(|n| n.addr == *addr)
    }

    /// Get the number of nodes in the routing table
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Number of nodes that completed a round trip recently
    pub fn good_node_count(&self) -> usize {
        self.buckets.iter().flat_map(|b| b.nodes.iter()).filter(|n| n.is_good()).count()
    }

    /// Get the bucket index for a node ID
    fn get_bucket_index(&self, id: &NodeId) -> usize {
        // Find the first bit where the IDs differ
        for i in 0..160 {
            let byte_index = i / 8;
            let bit_index = 7 - (i % 8);
            let our_bit = (self.our_id.0[byte_index] >> bit_index) & 1;
            let their_bit = (id.0[byte_index] >> bit_index) & 1;
            if our_bit != their_bit {
                return i;
            }
        }
        159 // IDs are identical
    }

    /// A random id that falls into the given bucket, used to refresh it
    pub fn random_id_in_bucket(&self, bucket_index: usize) -> NodeId {
        let mut id = NodeId::random().0;
        let bucket_index = bucket_index.min(159);
        for i in 0..=bucket_index {
            let byte_index = i / 8;
            let mask = 1u8 << (7 - (i % 8));
            let our_bit = self.our_id.0[byte_index] & mask;
            let bit = if i == bucket_index { our_bit ^ mask } else { our_bit };
            id[byte_index] = (id[byte_index] & !mask) | bit;
        }
        NodeId(id)
    }

    /// Get all non-empty buckets that need refreshing
    pub fn get_stale_buckets(&self, timeout: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_changed.elapsed() > timeout)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_routing_table_new() {
        let our_id = NodeId::new([1u8; 20]);
        let table = RoutingTable::new(our_id);
        assert_eq!(table.our_id, our_id);
        assert_eq!(table.buckets.len(), 160);
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_insert_and_update() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        let id = NodeId::new([2u8; 20]);
        assert_eq!(table.record_candidate(id, addr(6881)), InsertOutcome::Added);
        assert_eq!(table.record_response(id, addr(6882)), InsertOutcome::Updated);
        assert_eq!(table.node_count(), 1);

        let node = table.find_node(&id).unwrap();
        assert_eq!(node.addr, addr(6882));
        assert_eq!(node.status, NodeStatus::Available);
    }

    #[test]
    fn test_own_id_rejected() {
        let our_id = NodeId::new([7u8; 20]);
        let mut table = RoutingTable::new(our_id);
        assert_eq!(table.record_response(our_id, addr(1)), InsertOutcome::Rejected);
    }

    #[test]
    fn test_bucket_capacity() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        // All ids share the top bit, so they land in bucket 0
        for i in 0..K as u8 + 2 {
            let mut id = [0x80u8; 20];
            id[19] = i;
            table.record_candidate(NodeId::new(id), addr(7000 + i as u16));
        }
        assert_eq!(table.buckets[0].len(), K);
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_silent_node_evicted_for_responder() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        let mut ids = Vec::new();
        for i in 0..K as u8 {
            let mut id = [0x80u8; 20];
            id[19] = i;
            ids.push(NodeId::new(id));
            table.record_response(NodeId::new(id), addr(7000 + i as u16));
        }

        let mut newcomer = [0x80u8; 20];
        newcomer[19] = 0xFF;
        let newcomer = NodeId::new(newcomer);

        // Every node is healthy, the newcomer is turned away
        assert_eq!(table.record_response(newcomer, addr(8000)), InsertOutcome::Rejected);

        table.record_failure(&ids[3]);
        table.record_failure(&ids[3]);
        assert_eq!(table.record_response(newcomer, addr(8000)), InsertOutcome::Replaced(ids[3]));
        assert!(table.find_node(&ids[3]).is_none());
        assert!(table.find_node(&newcomer).is_some());
    }

    #[test]
    fn test_candidate_never_evicts() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        for i in 0..K as u8 {
            let mut id = [0x80u8; 20];
            id[19] = i;
            table.record_candidate(NodeId::new(id), addr(7000 + i as u16));
            table.record_failure(&NodeId::new(id));
            table.record_failure(&NodeId::new(id));
        }
        let mut id = [0x80u8; 20];
        id[19] = 0xFF;
        assert_eq!(table.record_candidate(NodeId::new(id), addr(8000)), InsertOutcome::Rejected);
    }

    #[test]
    fn test_find_closest_ten_nodes() {
        // Ids 0..=7 share bucket 4 with this local id, 8 and 9 land in bucket 6
        let mut table = RoutingTable::new(NodeId::new([0x0Au8; 20]));
        for i in 0u8..10 {
            table.record_response(NodeId::new([i; 20]), addr(6000 + i as u16));
        }

        let target = NodeId::new([5u8; 20]);
        let closest = table.find_closest(&target, 8);
        assert_eq!(closest.len(), 8);

        let ids: Vec<u8> = closest.iter().map(|n| n.id.0[0]).collect();
        // XOR distances to 5: 5->0, 4->1, 7->2, 6->3, 1->4, 0->5, 3->6, 2->7, 9->12, 8->13
        assert_eq!(ids, vec![5, 4, 7, 6, 1, 0, 3, 2]);
    }

    #[test]
    fn test_find_closest_sorted_and_bounded() {
        let mut table = RoutingTable::new(NodeId::random());
        for _ in 0..50 {
            table.record_response(NodeId::random(), addr(6881));
        }
        let target = NodeId::random();
        let closest = table.find_closest(&target, K);
        assert!(closest.len() <= K);
        for pair in closest.windows(2) {
            assert!(pair[0].distance_to(&target) < pair[1].distance_to(&target));
        }
    }

    #[test]
    fn test_find_closest_fewer_than_k() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        table.record_response(NodeId::new([1u8; 20]), addr(1));
        table.record_response(NodeId::new([2u8; 20]), addr(2));
        assert_eq!(table.find_closest(&NodeId::new([3u8; 20]), 8).len(), 2);
    }

    #[test]
    fn test_remove_node() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        let id = NodeId::new([9u8; 20]);
        table.record_response(id, addr(1));
        assert!(table.remove_node(&id).is_some());
        assert!(table.remove_node(&id).is_none());
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_random_id_in_bucket() {
        let table = RoutingTable::new(NodeId::random());
        for bucket in [0usize, 7, 8, 42, 159] {
            let id = table.random_id_in_bucket(bucket);
            assert_eq!(table.get_bucket_index(&id), bucket);
        }
    }

    #[test]
    fn test_find_by_addr() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        table.record_response(NodeId::new([3u8; 20]), addr(4242));
        assert_eq!(table.find_by_addr(&addr(4242)).map(|n| n.id), Some(NodeId::new([3u8; 20])));
    }

    #[test]
    fn test_query_sender_is_not_good() {
        let mut table = RoutingTable::new(NodeId::new([0u8; 20]));
        let stranger = NodeId::new([7u8; 20]);
        assert_eq!(table.record_query(stranger, addr(6881)), InsertOutcome::Added);
        assert_eq!(table.find_node(&stranger).unwrap().status, NodeStatus::Unused);
        assert_eq!(table.good_node_count(), 0);

        let flaky = NodeId::new([9u8; 20]);
        table.record_response(flaky, addr(6882));
        table.record_failure(&flaky);
        table.record_failure(&flaky);
        assert_eq!(table.record_query(flaky, addr(6883)), InsertOutcome::Updated);
        let node = table.find_node(&flaky).unwrap();
        assert_eq!(node.failed_queries, 2);
        assert_eq!(node.addr, addr(6883));
    }

}
