//! Torrent registry
//!
//! Maps info-hashes to sessions so DHT, trackers, PEX and inbound
//! connections all resolve a torrent to the same session.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::torrent::info::TorrentInfo;
use crate::torrent::session::{DiscoveryOnly, PieceCompletion, TorrentSession};

/// Every torrent this node serves
#[derive(Debug, Default)]
pub struct TorrentManager {
    sessions: RwLock<HashMap<[u8; 20], Arc<TorrentSession>>>,
}

impl TorrentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, or return the one already registered for its hash
    pub async fn insert(&self, session: TorrentSession) -> Arc<TorrentSession> {
        let info_hash = session.info_hash();
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&info_hash) {
            debug!("Torrent {} already registered", hex::encode(info_hash));
            match session.info() {
                Some(info) if !existing.has_metadata() => {
                    existing.set_completion(session.completion());
                    existing.set_info((*info).clone());
                }
                _ => {}
            }
            existing.add_trackers(&session.trackers());
            return Arc::clone(existing);
        }
        info!("Registered torrent {} ({})", session.name(), hex::encode(info_hash));
        let session = Arc::new(session);
        sessions.insert(info_hash, Arc::clone(&session));
        session
    }

    /// Register a torrent with known metainfo
    pub async fn register(&self, info: TorrentInfo, completion: Arc<dyn PieceCompletion>) -> Arc<TorrentSession> {
        self.insert(TorrentSession::from_info(info, completion)).await
    }

    /// Register a torrent known only by its info-hash
    pub async fn register_magnet(&self, info_hash: [u8; 20], name: impl Into<String>) -> Arc<TorrentSession> {
        self.insert(TorrentSession::new(info_hash, name, None, Arc::new(DiscoveryOnly))).await
    }

    pub async fn get(&self, info_hash: &[u8; 20]) -> Option<Arc<TorrentSession>> {
        self.sessions.read().await.get(info_hash).cloned()
    }

    pub async fn contains(&self, info_hash: &[u8; 20]) -> bool {
        self.sessions.read().await.contains_key(info_hash)
    }

    pub async fn remove(&self, info_hash: &[u8; 20]) -> Option<Arc<TorrentSession>> {
        let removed = self.sessions.write().await.remove(info_hash);
        if removed.is_some() {
            info!("Removed torrent {}", hex::encode(info_hash));
        }
        removed
    }

    pub async fn info_hashes(&self) -> Vec<[u8; 20]> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn sessions(&self) -> Vec<Arc<TorrentSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
