//! DHT (Distributed Hash Table) module
//!
//! Implements the BitTorrent Mainline DHT for peer discovery without a
//! tracker.
//!
//! Lock ordering: the routing table lock is never acquired while a peer
//! registry lock is held. Responders that need both read the registry
//! first, release it, and only then touch the table.

pub mod node;
pub mod routing;
pub mod message;
pub mod request;
pub mod token;
pub mod bootstrap;
pub mod dht;

// Re-exports for convenience
pub use node::{NodeId, NodeSession, NodeStatus};
pub use routing::{InsertOutcome, KBucket, RoutingTable};
pub use message::{
    DhtMessage, QueryType, parse_compact_nodes, parse_compact_peers,
    serialize_compact_nodes, serialize_compact_peers,
};
pub use request::{PendingRequests, RequestOutcome, ResponseSlot};
pub use token::TokenManager;
pub use bootstrap::{BootstrapConfig, LookupResult, bootstrap, discover_peers, lookup_peers, announce};
pub use dht::{GetPeersReply, DHT};
