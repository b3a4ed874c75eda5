//! Peer management module
//!
//! Peer sessions, the per-torrent registry, live connections, local
//! service discovery and the shared transfer rate limits.

pub mod connection;
pub mod limiter;
pub mod lsd;
pub mod manager;
pub mod state;

// Re-export main types
pub use connection::{accept, connect, PeerConnection, PeerContext};
pub use limiter::{Bandwidth, RateLimiter};
pub use lsd::LocalDiscovery;
pub use manager::{ConnectionHandle, OptimizeReport, PeerCommand, PeerManager, DEFAULT_UPLOAD_SLOTS};
pub use state::{PeerSession, PeerSnapshot, PeerSource, PeerState, PeerStats};
