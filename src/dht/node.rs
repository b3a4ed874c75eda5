//! DHT node module
//!
//! Node identifiers and the per-node session kept in the routing table.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

/// Nodes silent for longer than this are no longer considered good
pub const GOOD_NODE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Failed queries after which a node becomes the first eviction candidate
pub const MAX_FAILED_QUERIES: u32 = 2;

/// DHT node identifier (20 bytes)
///
/// Info-hashes share the same 160-bit keyspace, so lookups for a torrent use
/// `NodeId::from(info_hash)` as the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut id = [0u8; 20];
        rng.fill(&mut id);
        Self(id)
    }

    /// Build a NodeId from a slice that must be exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().and_then(|bytes| Self::from_slice(&bytes))
    }

    /// XOR distance between two identifiers
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (i, d) in distance.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        distance
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(id: [u8; 20]) -> Self {
        Self(id)
    }
}

/// Lifecycle of a node in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Learned from a node list, never contacted
    Unused,
    /// A query is outstanding
    Verify,
    /// Completed at least one round trip
    Available,
}

/// A known DHT node
#[derive(Debug, Clone)]
pub struct NodeSession {
    /// Node identifier
    pub id: NodeId,
    /// Node address
    pub addr: SocketAddr,
    /// Last time the node sent us anything
    pub last_activity: Instant,
    /// Consecutive queries that went unanswered
    pub failed_queries: u32,
    pub status: NodeStatus,
}

impl NodeSession {
    /// Create a session for a node we have only heard about
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_activity: Instant::now(),
            failed_queries: 0,
            status: NodeStatus::Unused,
        }
    }

    /// Create a session for a node that has just talked to us
    pub fn responded(id: NodeId, addr: SocketAddr) -> Self {
        let mut node = Self::new(id, addr);
        node.status = NodeStatus::Available;
        node
    }

    /// Calculate XOR distance to an identifier
    pub fn distance_to(&self, other: &NodeId) -> [u8; 20] {
        self.id.distance(other)
    }

    /// Good nodes answered recently and are not failing
    pub fn is_good(&self) -> bool {
        self.status == NodeStatus::Available
            && self.failed_queries < MAX_FAILED_QUERIES
            && self.last_activity.elapsed() < GOOD_NODE_WINDOW
    }

    /// Whether this node should make room for a node that is responding
    pub fn is_evictable(&self) -> bool {
        self.failed_queries >= MAX_FAILED_QUERIES || self.last_activity.elapsed() >= GOOD_NODE_WINDOW
    }

    /// Record a successful round trip
    pub fn mark_responded(&mut self) {
        self.status = NodeStatus::Available;
        self.failed_queries = 0;
        self.last_activity = Instant::now();
    }

    /// Record an unanswered query
    pub fn mark_failed(&mut self) {
        self.failed_queries += 1;
    }

    /// Record an outgoing query
    pub fn mark_verifying(&mut self) {
        if self.status == NodeStatus::Unused {
            self.status = NodeStatus::Verify;
        }
    }

    /// Get the time since last activity
    pub fn time_since_seen(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl PartialEq for NodeSession {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeSession {}

impl std::hash::Hash for NodeSession {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
