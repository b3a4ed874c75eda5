//! Torrent module
//!
//! Metainfo and magnet link parsing, per-torrent sessions, the torrent
//! registry and the engine that drives discovery for all of them.

pub mod parser;
pub mod info;
pub mod magnet;
pub mod session;
pub mod manager;
pub mod engine;

pub use parser::{build_torrent, TorrentParser};
pub use info::{FileSpan, TorrentFile, TorrentInfo};
pub use magnet::{MagnetInfo, MagnetParser};
pub use session::{DiscoveryOnly, PieceCompletion, PieceTracker, SessionStats, TorrentSession};
pub use manager::TorrentManager;
pub use engine::SwarmEngine;
