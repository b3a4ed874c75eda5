//! Tracker manager
//!
//! Owns the pool of tracker clients (one per announce URL) and the
//! launchers of every torrent. A torrent whose own announce list is short
//! is topped up from the pool unless it is private.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::peer::PeerManager;
use crate::torrent::TorrentSession;
use crate::tracker::{TrackerClient, TrackerLauncher, TrackerTransport};

/// Launchers wanted per torrent
pub const DEFAULT_TRACKER_SIZE: usize = 8;

pub struct TrackerManager {
    peers: Arc<PeerManager>,
    peer_id: [u8; 20],
    port: u16,
    tracker_size: usize,
    next_id: AtomicU32,
    /// Keyed by announce URL
    clients: RwLock<HashMap<String, Arc<TrackerClient>>>,
    launchers: RwLock<HashMap<[u8; 20], Vec<Arc<TrackerLauncher>>>>,
}

impl TrackerManager {
    pub fn new(peers: Arc<PeerManager>, peer_id: [u8; 20], port: u16, tracker_size: usize) -> Self {
        Self {
            peers,
            peer_id,
            port,
            tracker_size,
            next_id: AtomicU32::new(1),
            clients: RwLock::new(HashMap::new()),
            launchers: RwLock::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Client for `url`, opened on first use
    pub async fn register(&self, url: &str) -> Result<Arc<TrackerClient>> {
        let url = url.trim();
        if url.is_empty() {
            return Err(TorrentError::tracker_error("Empty announce URL").into());
        }
        if let Some(client) = self.clients.read().await.get(url) {
            return Ok(Arc::clone(client));
        }
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(url) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(TrackerClient::open(self.next_id(), url)?);
        debug!("Registered tracker {} ({})", client.id(), url);
        clients.insert(url.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Add a client backed by a custom transport
    pub async fn register_transport(&self, transport: Arc<dyn TrackerTransport>) -> Arc<TrackerClient> {
        let url = transport.url().to_string();
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&url) {
            return Arc::clone(client);
        }
        let client = Arc::new(TrackerClient::new(self.next_id(), transport));
        clients.insert(url, Arc::clone(&client));
        client
    }

    /// Seed the pool with extra announce URLs; bad URLs are skipped
    pub async fn register_all(&self, urls: &[String]) -> usize {
        let mut added = 0;
        for url in urls {
            match self.register(url).await {
                Ok(_) => added += 1,
                Err(e) => warn!("Skipping tracker {}: {}", url, e),
            }
        }
        added
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Usable clients for a torrent: its own trackers first, then pool
    /// clients with the fewest failures up to `tracker_size`
    pub async fn clients_for(&self, urls: &[String], private: bool) -> Vec<Arc<TrackerClient>> {
        let mut selected: Vec<Arc<TrackerClient>> = Vec::new();
        for url in urls {
            match self.register(url).await {
                Ok(client) if client.available() => {
                    if !selected.iter().any(|c| c.id() == client.id()) {
                        selected.push(client);
                    }
                }
                Ok(_) => debug!("Tracker {} unavailable", url),
                Err(e) => warn!("Skipping tracker {}: {}", url, e),
            }
        }
        if private || selected.len() >= self.tracker_size {
            return selected;
        }

        let mut extra: Vec<Arc<TrackerClient>> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.available() && !selected.iter().any(|s| s.id() == c.id()))
            .cloned()
            .collect();
        extra.sort_by_key(|c| (c.failures(), c.id()));
        extra.truncate(self.tracker_size - selected.len());
        selected.extend(extra);
        selected
    }

    /// Create the launchers of `torrent`, or top them up when some became
    /// unavailable. Returns every live launcher of the torrent.
    pub async fn load(&self, torrent: &Arc<TorrentSession>) -> Vec<Arc<TrackerLauncher>> {
        let info_hash = torrent.info_hash();
        let clients = self.clients_for(&torrent.trackers(), torrent.is_private()).await;

        let mut launchers = self.launchers.write().await;
        let entry = launchers.entry(info_hash).or_default();
        entry.retain(|l| l.available());
        for client in clients {
            if entry.len() >= self.tracker_size.max(1) {
                break;
            }
            if entry.iter().any(|l| l.client().id() == client.id()) {
                continue;
            }
            entry.push(Arc::new(TrackerLauncher::new(
                self.next_id(),
                client,
                Arc::clone(torrent),
                Arc::clone(&self.peers),
                self.peer_id,
                self.port,
            )));
        }
        debug!("Torrent {} has {} tracker launchers", hex::encode(info_hash), entry.len());
        entry.clone()
    }

    pub async fn launchers(&self, info_hash: &[u8; 20]) -> Vec<Arc<TrackerLauncher>> {
        self.launchers.read().await.get(info_hash).cloned().unwrap_or_default()
    }

    /// Announce every due launcher of `torrent`.
    ///
    /// Fails with `DownloadFailure` when the torrent has no usable tracker.
    pub async fn find_peers(&self, torrent: &Arc<TorrentSession>) -> Result<usize> {
        let launchers = self.load(torrent).await;
        if launchers.is_empty() {
            return Err(TorrentError::download_failure_for("No usable tracker", hex::encode(torrent.info_hash())).into());
        }
        let mut found = 0;
        let mut answered = false;
        for launcher in launchers.iter().filter(|l| l.due()) {
            match launcher.find_peers().await {
                Ok(n) => {
                    found += n;
                    answered = true;
                }
                Err(e) => debug!("Tracker {} announce failed: {}", launcher.url(), e),
            }
        }
        if !answered && launchers.iter().all(|l| !l.available()) {
            return Err(TorrentError::download_failure_for("Every tracker failed", hex::encode(torrent.info_hash())).into());
        }
        Ok(found)
    }

    /// Send `completed` through every launcher of a torrent
    pub async fn complete(&self, info_hash: &[u8; 20]) -> usize {
        let mut sent = 0;
        for launcher in self.launchers(info_hash).await {
            match launcher.complete().await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => debug!("Tracker {} completion notice failed: {}", launcher.url(), e),
            }
        }
        sent
    }

    /// Release and forget the launchers of one torrent
    pub async fn release(&self, info_hash: &[u8; 20]) {
        let launchers = self.launchers.write().await.remove(info_hash).unwrap_or_default();
        if launchers.is_empty() {
            return;
        }
        info!("Releasing {} tracker launchers of {}", launchers.len(), hex::encode(info_hash));
        let tasks: Vec<_> = launchers
            .into_iter()
            .map(|launcher| tokio::spawn(async move { launcher.release().await }))
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Tracker release task of {} failed: {}", hex::encode(info_hash), e);
            }
        }
    }

    /// Release every torrent's launchers
    pub async fn shutdown(&self) {
        let info_hashes: Vec<[u8; 20]> = self.launchers.read().await.keys().copied().collect();
        for info_hash in info_hashes {
            self.release(&info_hash).await;
        }
    }
}

impl std::fmt::Debug for TrackerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerManager")
            .field("port", &self.port)
            .field("tracker_size", &self.tracker_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::DiscoveryOnly;
    use crate::tracker::client::tests::MockTransport;
    use crate::tracker::TrackerEvent;
    use std::sync::atomic::Ordering;

    fn manager(size: usize) -> TrackerManager {
        TrackerManager::new(Arc::new(PeerManager::new(4)), [1u8; 20], 6881, size)
    }

    fn torrent(trackers: &[&str]) -> Arc<TorrentSession> {
        let session = TorrentSession::new([4u8; 20], "t", None, Arc::new(DiscoveryOnly));
        session.add_trackers(&trackers.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        Arc::new(session)
    }

    #[tokio::test]
    async fn test_one_client_per_url() {
        let manager = manager(4);
        let a = manager.register("udp://tracker.example:6969/announce").await.unwrap();
        let b = manager.register(" udp://tracker.example:6969/announce ").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.register("gopher://x").await.is_err());
        assert_eq!(manager.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_top_up_from_pool_unless_private() {
        let manager = manager(3);
        for url in ["udp://a:1", "udp://b:1", "udp://c:1"] {
            manager.register_transport(MockTransport::new(url, Vec::new(), 1800)).await;
        }

        let public = manager.clients_for(&["udp://a:1".to_string()], false).await;
        assert_eq!(public.len(), 3);
        assert_eq!(public[0].url(), "udp://a:1");

        let private = manager.clients_for(&["udp://a:1".to_string()], true).await;
        assert_eq!(private.len(), 1);
    }

    #[tokio::test]
    async fn test_load_find_and_release() {
        let manager = manager(2);
        let first = MockTransport::new("udp://a:1", vec!["10.1.1.1:1".parse().unwrap()], 1800);
        let second = MockTransport::new("udp://b:1", vec!["10.1.1.2:1".parse().unwrap()], 1800);
        manager.register_transport(first.clone()).await;
        manager.register_transport(second.clone()).await;
        let torrent = torrent(&["udp://a:1", "udp://b:1"]);

        assert_eq!(manager.find_peers(&torrent).await.unwrap(), 2);
        assert_eq!(manager.launchers(&torrent.info_hash()).await.len(), 2);
        // Not due again
        assert_eq!(manager.find_peers(&torrent).await.unwrap(), 0);

        manager.release(&torrent.info_hash()).await;
        manager.release(&torrent.info_hash()).await;
        assert_eq!(first.events(), vec![TrackerEvent::Started, TrackerEvent::Stopped]);
        assert_eq!(second.events(), vec![TrackerEvent::Started, TrackerEvent::Stopped]);
    }

    #[tokio::test]
    async fn test_exhausted_trackers_are_download_failure() {
        let manager = manager(1);
        let transport = MockTransport::new("udp://a:1", Vec::new(), 1800);
        transport.fail.store(true, Ordering::SeqCst);
        manager.register_transport(transport.clone()).await;
        let session = torrent(&["udp://a:1"]);

        for _ in 0..2 {
            assert_eq!(manager.find_peers(&session).await.unwrap(), 0);
            // Retry allowed right away
            for launcher in manager.launchers(&session.info_hash()).await {
                launcher.find_peers().await.ok();
            }
        }
        let err = manager.find_peers(&session).await.unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(TorrentError::DownloadFailure { .. })));

        let empty = torrent(&[]);
        let err = manager.find_peers(&empty).await.unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(TorrentError::DownloadFailure { .. })));
    }

    /// Answers `started`, panics on the final announce
    struct PanicOnStop;

    #[async_trait::async_trait]
    impl TrackerTransport for PanicOnStop {
        fn url(&self) -> &str {
            "udp://panics:1"
        }

        async fn announce(&self, request: &crate::tracker::AnnounceRequest) -> Result<crate::tracker::AnnounceResponse> {
            assert_ne!(request.event, TrackerEvent::Stopped, "tracker blew up");
            Ok(crate::tracker::AnnounceResponse { interval: 1800, ..Default::default() })
        }

        async fn scrape(&self, _info_hash: &[u8; 20]) -> Result<crate::tracker::ScrapeResponse> {
            Ok(crate::tracker::ScrapeResponse::default())
        }
    }

    #[tokio::test]
    async fn test_release_survives_panicking_task() {
        let manager = manager(2);
        manager.register_transport(Arc::new(PanicOnStop)).await;
        let healthy = MockTransport::new("udp://b:1", Vec::new(), 1800);
        manager.register_transport(healthy.clone()).await;
        let session = torrent(&["udp://panics:1", "udp://b:1"]);

        manager.find_peers(&session).await.unwrap();
        manager.release(&session.info_hash()).await;
        assert_eq!(healthy.events(), vec![TrackerEvent::Started, TrackerEvent::Stopped]);
        assert!(manager.launchers(&session.info_hash()).await.is_empty());
    }

}
