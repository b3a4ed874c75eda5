//! Tracker launcher
//!
//! Binds one tracker client to one torrent: sends `started` on the first
//! announce, re-announces on the tracker's interval and sends a final
//! `stopped` or `completed` when released. Release is idempotent.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::peer::{PeerManager, PeerSource};
use crate::torrent::TorrentSession;
use crate::tracker::{AnnounceRequest, AnnounceResponse, TrackerClient, TrackerEvent};

/// Lower bound of the re-announce interval
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound of the re-announce interval
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);
/// Interval used until a tracker answers
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);
/// Peers asked for on each announce
pub const DEFAULT_NUMWANT: i32 = 50;

#[derive(Debug)]
struct LauncherState {
    interval: Duration,
    seeders: u32,
    leechers: u32,
    next_announce: Option<Instant>,
    started: bool,
    completed_sent: bool,
    available: bool,
    needs_release: bool,
}

pub struct TrackerLauncher {
    id: u32,
    client: Arc<TrackerClient>,
    torrent: Arc<TorrentSession>,
    peers: Arc<PeerManager>,
    peer_id: [u8; 20],
    port: u16,
    key: u32,
    state: Mutex<LauncherState>,
}

/// Server interval honouring `min interval`, clamped to sane bounds
pub fn clamp_interval(response: &AnnounceResponse) -> Duration {
    let secs = response.interval.max(response.min_interval.unwrap_or(0));
    Duration::from_secs(u64::from(secs)).clamp(MIN_INTERVAL, MAX_INTERVAL)
}

impl TrackerLauncher {
    pub fn new(
        id: u32,
        client: Arc<TrackerClient>,
        torrent: Arc<TorrentSession>,
        peers: Arc<PeerManager>,
        peer_id: [u8; 20],
        port: u16,
    ) -> Self {
        Self {
            id,
            client,
            torrent,
            peers,
            peer_id,
            port,
            key: rand::random(),
            state: Mutex::new(LauncherState {
                interval: DEFAULT_INTERVAL,
                seeders: 0,
                leechers: 0,
                next_announce: None,
                started: false,
                completed_sent: false,
                available: true,
                needs_release: false,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }

    pub fn client(&self) -> &Arc<TrackerClient> {
        &self.client
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.torrent.info_hash()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LauncherState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Not released and the client still usable
    pub fn available(&self) -> bool {
        self.with_state(|s| s.available) && self.client.available()
    }

    pub fn interval(&self) -> Duration {
        self.with_state(|s| s.interval)
    }

    pub fn seeders(&self) -> u32 {
        self.with_state(|s| s.seeders)
    }

    pub fn leechers(&self) -> u32 {
        self.with_state(|s| s.leechers)
    }

    /// Whether a regular announce is due
    pub fn due(&self) -> bool {
        self.available() && self.with_state(|s| s.next_announce.map_or(true, |at| Instant::now() >= at))
    }

    fn request(&self, event: TrackerEvent) -> AnnounceRequest {
        let mut request = AnnounceRequest::new(self.torrent.info_hash(), self.peer_id, self.port)
            .with_event(event)
            .with_transfer(self.torrent.uploaded(), self.torrent.downloaded(), self.torrent.left());
        request.key = self.key;
        request.numwant = if event == TrackerEvent::Stopped { 0 } else { DEFAULT_NUMWANT };
        request
    }

    /// Announce and feed the returned peers into the registry.
    ///
    /// Returns the number of peers the tracker handed out.
    pub async fn find_peers(&self) -> Result<usize> {
        let event = self.with_state(|s| {
            s.needs_release = true;
            if s.started { TrackerEvent::None } else { TrackerEvent::Started }
        });
        if !self.available() {
            return Ok(0);
        }

        let request = self.request(event);
        let response = match self.client.announce(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.with_state(|s| s.next_announce = Some(Instant::now() + MIN_INTERVAL));
                return Err(e);
            }
        };

        let interval = clamp_interval(&response);
        self.with_state(|s| {
            s.started = true;
            s.interval = interval;
            s.seeders = response.complete.unwrap_or(s.seeders);
            s.leechers = response.incomplete.unwrap_or(s.leechers);
            s.next_announce = Some(Instant::now() + interval);
        });
        debug!(
            "Tracker {} answered: {} peers, {} seeders, {} leechers, next in {:?}",
            self.url(),
            response.peers.len(),
            self.seeders(),
            self.leechers(),
            interval
        );

        let info_hash = self.torrent.info_hash();
        for addr in &response.peers {
            self.peers.new_peer_session(info_hash, *addr, PeerSource::Tracker).await;
        }
        Ok(response.peers.len())
    }

    /// Announce `completed` once the torrent first reaches completion
    pub async fn complete(&self) -> Result<bool> {
        let send = self.with_state(|s| {
            let send = s.available && s.started && !s.completed_sent;
            if send {
                s.completed_sent = true;
            }
            send
        });
        if !send || !self.client.available() {
            return Ok(false);
        }
        info!("Tracker {} completion notice", self.url());
        self.client.announce(&self.request(TrackerEvent::Completed)).await?;
        Ok(true)
    }

    /// Final announce: `completed` if completion was reached but never
    /// announced, `stopped` otherwise. Later calls do nothing.
    pub async fn release(&self) -> bool {
        let complete = self.torrent.is_complete();
        let event = self.with_state(|s| {
            if !s.needs_release || !s.available {
                return None;
            }
            s.needs_release = false;
            s.available = false;
            if complete && !s.completed_sent {
                s.completed_sent = true;
                Some(TrackerEvent::Completed)
            } else {
                Some(TrackerEvent::Stopped)
            }
        });
        let Some(event) = event else {
            return false;
        };
        if !self.client.available() {
            return false;
        }
        debug!("Tracker {} release ({})", self.url(), event);
        if let Err(e) = self.client.announce(&self.request(event)).await {
            warn!("Tracker {} release announce failed: {}", self.url(), e);
        }
        true
    }
}

impl std::fmt::Debug for TrackerLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerLauncher")
            .field("id", &self.id)
            .field("url", &self.url())
            .field("info_hash", &hex::encode(self.torrent.info_hash()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::tests::sample_info;
    use crate::torrent::{PieceTracker, TorrentInfo};
    use crate::tracker::client::tests::MockTransport;
    use std::sync::atomic::Ordering;

    fn launcher(transport: Arc<MockTransport>, torrent: Arc<TorrentSession>, peers: Arc<PeerManager>) -> TrackerLauncher {
        let client = Arc::new(TrackerClient::new(1, transport));
        TrackerLauncher::new(7, client, torrent, peers, [3u8; 20], 6881)
    }

    fn seeded_session() -> Arc<TorrentSession> {
        let raw = sample_info("seed.bin", 64, 16);
        let info = TorrentInfo::from_info_bytes(&raw, Vec::new()).unwrap();
        let tracker = Arc::new(PieceTracker::seeded(&info));
        Arc::new(TorrentSession::from_info(info, tracker))
    }

    fn magnet_session() -> Arc<TorrentSession> {
        Arc::new(TorrentSession::new([5u8; 20], "magnet", None, Arc::new(crate::torrent::DiscoveryOnly)))
    }

    #[test]
    fn test_interval_clamp() {
        let response = |interval, min| AnnounceResponse { interval, min_interval: min, ..Default::default() };
        assert_eq!(clamp_interval(&response(5, None)), MIN_INTERVAL);
        assert_eq!(clamp_interval(&response(100_000, None)), MAX_INTERVAL);
        assert_eq!(clamp_interval(&response(600, Some(900))), Duration::from_secs(900));
        assert_eq!(clamp_interval(&response(1200, None)), Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn test_started_then_regular_announce() {
        let peer: std::net::SocketAddr = "10.0.0.9:6881".parse().unwrap();
        let transport = MockTransport::new("udp://mock:1", vec![peer], 10);
        let peers = Arc::new(PeerManager::new(4));
        let torrent = magnet_session();
        let launcher = launcher(transport.clone(), torrent.clone(), peers.clone());

        assert!(launcher.due());
        assert_eq!(launcher.find_peers().await.unwrap(), 1);
        assert_eq!(launcher.interval(), MIN_INTERVAL);
        assert_eq!(launcher.seeders(), 2);
        assert_eq!(launcher.leechers(), 5);
        assert!(!launcher.due());

        launcher.find_peers().await.unwrap();
        assert_eq!(transport.events(), vec![TrackerEvent::Started, TrackerEvent::None]);

        let session = peers.find(&torrent.info_hash(), &peer).await.unwrap();
        assert!(session.has_source(PeerSource::Tracker));
    }

    #[tokio::test]
    async fn test_failed_start_is_retried_as_started() {
        let transport = MockTransport::new("udp://mock:1", Vec::new(), 1800);
        let launcher = launcher(transport.clone(), magnet_session(), Arc::new(PeerManager::new(4)));
        transport.fail.store(true, Ordering::SeqCst);
        assert!(launcher.find_peers().await.is_err());
        transport.fail.store(false, Ordering::SeqCst);
        launcher.find_peers().await.unwrap();
        assert_eq!(transport.events(), vec![TrackerEvent::Started, TrackerEvent::Started]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let transport = MockTransport::new("udp://mock:1", Vec::new(), 1800);
        let launcher = launcher(transport.clone(), magnet_session(), Arc::new(PeerManager::new(4)));

        // Never queried: nothing to release
        assert!(!launcher.release().await);
        assert!(transport.events().is_empty());

        launcher.find_peers().await.unwrap();
        assert!(launcher.release().await);
        assert!(!launcher.release().await);
        assert_eq!(transport.events(), vec![TrackerEvent::Started, TrackerEvent::Stopped]);
        assert!(!launcher.available());
        assert_eq!(launcher.find_peers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_after_completion_sends_completed_once() {
        let transport = MockTransport::new("udp://mock:1", Vec::new(), 1800);
        let launcher = launcher(transport.clone(), seeded_session(), Arc::new(PeerManager::new(4)));
        launcher.find_peers().await.unwrap();
        assert!(launcher.release().await);
        assert!(!launcher.release().await);
        assert_eq!(transport.events(), vec![TrackerEvent::Started, TrackerEvent::Completed]);
    }

    #[tokio::test]
    async fn test_completed_not_repeated_on_release() {
        let transport = MockTransport::new("udp://mock:1", Vec::new(), 1800);
        let launcher = launcher(transport.clone(), seeded_session(), Arc::new(PeerManager::new(4)));
        launcher.find_peers().await.unwrap();
        assert!(launcher.complete().await.unwrap());
        assert!(!launcher.complete().await.unwrap());
        assert!(launcher.release().await);
        assert_eq!(
            transport.events(),
            vec![TrackerEvent::Started, TrackerEvent::Completed, TrackerEvent::Stopped]
        );
    }
}
