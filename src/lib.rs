//! swarm-engine
//!
//! A BitTorrent swarm engine: Mainline DHT, the peer-wire protocol with
//! MSE encryption and LTEP extensions, HTTP/UDP trackers and the per-torrent
//! sessions that tie discovery together.

pub mod bencode;
pub mod torrent;
pub mod protocol;
pub mod peer;
pub mod dht;
pub mod tracker;
pub mod cli;
pub mod error;

pub use error::TorrentError;

pub use bencode::{BencodeDict, BencodeValue};
pub use torrent::{
    DiscoveryOnly, MagnetInfo, MagnetParser, PieceCompletion, PieceTracker, SessionStats, SwarmEngine,
    TorrentInfo, TorrentManager, TorrentParser, TorrentSession,
};
pub use protocol::{EncryptionMode, Handshake, Message, MessageId};
pub use peer::{LocalDiscovery, PeerCommand, PeerConnection, PeerManager, PeerSession, PeerSource, PeerState};
pub use dht::{
    BootstrapConfig, DhtMessage, KBucket, NodeId, NodeSession, QueryType, RoutingTable, DHT,
    bootstrap, discover_peers, announce, lookup_peers, parse_compact_nodes, parse_compact_peers,
    serialize_compact_nodes, serialize_compact_peers,
};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, TrackerClient, TrackerEvent, TrackerLauncher, TrackerManager,
    TrackerTransport,
};
pub use cli::{CliArgs, Config, Target};
