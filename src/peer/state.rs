//! Peer state module
//!
//! One [`PeerSession`] per (info-hash, host): where the peer came from, its
//! choke/interest flags, negotiated capabilities and transfer statistics.
//! Every field is atomic or behind a short-lived lock so the registry and
//! the connection tasks can share one `Arc<PeerSession>`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::protocol::handshake::{client_name, Reserved};
use crate::protocol::pex::{FLAG_ENCRYPTION, FLAG_HOLEPUNCH, FLAG_OUTGOING, FLAG_SEED, FLAG_UTP};

/// Failed connection attempts after which a peer is no longer available
pub const MAX_FAILURES: u32 = 3;

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Pex,
    Dht,
    /// Connected to us directly
    Connect,
    /// Local service discovery
    Lsd,
}

impl PeerSource {
    pub const ALL: [PeerSource; 5] =
        [PeerSource::Tracker, PeerSource::Pex, PeerSource::Dht, PeerSource::Connect, PeerSource::Lsd];

    pub fn bit(self) -> u8 {
        match self {
            PeerSource::Tracker => 0x01,
            PeerSource::Pex => 0x02,
            PeerSource::Dht => 0x04,
            PeerSource::Connect => 0x08,
            PeerSource::Lsd => 0x10,
        }
    }
}

/// Connection state of a peer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Known but not connected
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Handshake done
    Connected,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PeerState::Connecting,
            2 => PeerState::Connected,
            _ => PeerState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PeerState::Disconnected => 0,
            PeerState::Connecting => 1,
            PeerState::Connected => 2,
        }
    }
}

/// Transfer counters
///
/// Totals never reset. The window counters are drained by each
/// optimization pass to measure recent contribution.
#[derive(Debug, Default)]
pub struct PeerStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    window_downloaded: AtomicU64,
    marked: AtomicBool,
}

impl PeerStats {
    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Bytes (downloaded, uploaded) since the last call
    pub fn take_window(&self) -> (u64, u64) {
        (
            self.window_downloaded.swap(0, Ordering::Relaxed),
            self.window_uploaded.swap(0, Ordering::Relaxed),
        )
    }

    /// Whether a previous optimization pass has already seen this peer
    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Relaxed)
    }

    pub fn mark(&self) {
        self.marked.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct PeerDetails {
    peer_id: Option<[u8; 20]>,
    client: Option<&'static str>,
    reserved: Reserved,
    extension_ids: Vec<(String, u8)>,
}

/// A peer of one torrent
#[derive(Debug)]
pub struct PeerSession {
    info_hash: [u8; 20],
    addr: SocketAddr,
    sources: AtomicU8,
    state: AtomicU8,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    peer_choking: AtomicBool,
    peer_interested: AtomicBool,
    upload_only: AtomicBool,
    encrypted: AtomicBool,
    outgoing: AtomicBool,
    pex_flags: AtomicU8,
    failures: AtomicU32,
    unavailable: AtomicBool,
    listen_port: AtomicU16,
    dht_port: AtomicU16,
    stats: PeerStats,
    details: Mutex<PeerDetails>,
}

impl PeerSession {
    pub fn new(info_hash: [u8; 20], addr: SocketAddr) -> Self {
        Self {
            info_hash,
            addr,
            sources: AtomicU8::new(0),
            state: AtomicU8::new(PeerState::Disconnected.as_u8()),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            upload_only: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
            outgoing: AtomicBool::new(false),
            pex_flags: AtomicU8::new(0),
            failures: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            listen_port: AtomicU16::new(0),
            dht_port: AtomicU16::new(0),
            stats: PeerStats::default(),
            details: Mutex::new(PeerDetails::default()),
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn add_source(&self, source: PeerSource) {
        self.sources.fetch_or(source.bit(), Ordering::Relaxed);
    }

    pub fn has_source(&self, source: PeerSource) -> bool {
        self.sources.load(Ordering::Relaxed) & source.bit() != 0
    }

    pub fn sources(&self) -> Vec<PeerSource> {
        PeerSource::ALL.into_iter().filter(|s| self.has_source(*s)).collect()
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Leaving `Connected` resets the wire flags to their initial values
    pub fn set_state(&self, state: PeerState) {
        self.state.store(state.as_u8(), Ordering::Release);
        if state == PeerState::Disconnected {
            self.am_choking.store(true, Ordering::Relaxed);
            self.am_interested.store(false, Ordering::Relaxed);
            self.peer_choking.store(true, Ordering::Relaxed);
            self.peer_interested.store(false, Ordering::Relaxed);
        }
    }

    pub fn connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Relaxed)
    }

    pub fn set_am_choking(&self, choking: bool) {
        self.am_choking.store(choking, Ordering::Relaxed);
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Relaxed)
    }

    pub fn set_am_interested(&self, interested: bool) {
        self.am_interested.store(interested, Ordering::Relaxed);
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn set_peer_choking(&self, choking: bool) {
        self.peer_choking.store(choking, Ordering::Relaxed);
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.peer_interested.store(interested, Ordering::Relaxed);
    }

    /// We are a download partner: interested and unchoked by them
    pub fn downloading(&self) -> bool {
        self.connected() && self.am_interested() && !self.peer_choking()
    }

    /// We serve them: they are interested and we unchoked them
    pub fn uploading(&self) -> bool {
        self.connected() && self.peer_interested() && !self.am_choking()
    }

    pub fn is_upload_only(&self) -> bool {
        self.upload_only.load(Ordering::Relaxed)
    }

    pub fn set_upload_only(&self, upload_only: bool) {
        self.upload_only.store(upload_only, Ordering::Relaxed);
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::Relaxed)
    }

    pub fn set_encrypted(&self, encrypted: bool) {
        self.encrypted.store(encrypted, Ordering::Relaxed);
    }

    /// We reached the peer with an outgoing connection
    pub fn set_outgoing(&self, outgoing: bool) {
        self.outgoing.store(outgoing, Ordering::Relaxed);
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing.load(Ordering::Relaxed)
    }

    /// Flags another peer advertised for this one via PEX
    pub fn pex_flags(&self) -> u8 {
        self.pex_flags.load(Ordering::Relaxed)
    }

    pub fn set_pex_flags(&self, flags: u8) {
        self.pex_flags.store(flags, Ordering::Relaxed);
        if flags & FLAG_SEED != 0 {
            self.set_upload_only(true);
        }
    }

    /// Flags we advertise for this peer in our own PEX messages
    pub fn advertised_pex_flags(&self) -> u8 {
        let mut flags = self.pex_flags() & (FLAG_UTP | FLAG_HOLEPUNCH);
        if self.is_encrypted() {
            flags |= FLAG_ENCRYPTION;
        }
        if self.is_upload_only() {
            flags |= FLAG_SEED;
        }
        if self.is_outgoing() {
            flags |= FLAG_OUTGOING;
        }
        flags
    }

    /// Count a failed connection attempt
    pub fn fail(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// A successful handshake clears earlier failures
    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Never connect again (protocol violation, connection to self)
    pub fn mark_unavailable(&self) {
        self.unavailable.store(true, Ordering::Relaxed);
    }

    pub fn available(&self) -> bool {
        !self.unavailable.load(Ordering::Relaxed) && self.failures() < MAX_FAILURES && self.addr.port() != 0
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn set_handshake(&self, peer_id: [u8; 20], reserved: Reserved) {
        if let Ok(mut details) = self.details.lock() {
            details.peer_id = Some(peer_id);
            details.client = Some(client_name(&peer_id));
            details.reserved = reserved;
        }
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.details.lock().ok().and_then(|d| d.peer_id)
    }

    pub fn client_name(&self) -> Option<&'static str> {
        self.details.lock().ok().and_then(|d| d.client)
    }

    pub fn reserved(&self) -> Reserved {
        self.details.lock().map(|d| d.reserved).unwrap_or_default()
    }

    /// Extension ids from the peer's extension handshake
    pub fn set_extension_ids(&self, ids: Vec<(String, u8)>) {
        if let Ok(mut details) = self.details.lock() {
            details.extension_ids = ids;
        }
    }

    /// Sub-type the peer expects for `name`; `None` when disabled
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        let details = self.details.lock().ok()?;
        details.extension_ids.iter().find(|(n, id)| n == name && *id != 0).map(|(_, id)| *id)
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Relaxed);
    }

    pub fn set_dht_port(&self, port: u16) {
        self.dht_port.store(port, Ordering::Relaxed);
    }

    pub fn dht_port(&self) -> Option<u16> {
        match self.dht_port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    /// Address other peers can connect to: the advertised listen port when
    /// known, the observed address otherwise
    pub fn pex_addr(&self) -> SocketAddr {
        match self.listen_port.load(Ordering::Relaxed) {
            0 => self.addr,
            port => SocketAddr::new(self.addr.ip(), port),
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            addr: self.addr,
            sources: self.sources(),
            state: self.state(),
            client: self.client_name().map(str::to_string),
            am_choking: self.am_choking(),
            am_interested: self.am_interested(),
            peer_choking: self.peer_choking(),
            peer_interested: self.peer_interested(),
            upload_only: self.is_upload_only(),
            encrypted: self.is_encrypted(),
            uploaded: self.stats.uploaded(),
            downloaded: self.stats.downloaded(),
            failures: self.failures(),
        }
    }
}

/// Serializable view of a peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub sources: Vec<PeerSource>,
    pub state: PeerState,
    pub client: Option<String>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub upload_only: bool,
    pub encrypted: bool,
    pub uploaded: u64,
    pub downloaded: u64,
    pub failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PeerSession {
        PeerSession::new([1u8; 20], "127.0.0.1:6881".parse().unwrap())
    }

    #[test]
    fn test_peer_session_new() {
        let peer = session();
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(peer.am_choking());
        assert!(!peer.am_interested());
        assert!(peer.peer_choking());
        assert!(!peer.peer_interested());
        assert!(peer.available());
        assert!(peer.sources().is_empty());
    }

    #[test]
    fn test_sources_accumulate() {
        let peer = session();
        peer.add_source(PeerSource::Tracker);
        peer.add_source(PeerSource::Pex);
        peer.add_source(PeerSource::Tracker);
        assert_eq!(peer.sources(), vec![PeerSource::Tracker, PeerSource::Pex]);
        assert!(!peer.has_source(PeerSource::Dht));
    }

    #[test]
    fn test_download_and_upload_partners() {
        let peer = session();
        peer.set_am_interested(true);
        peer.set_peer_choking(false);
        assert!(!peer.downloading());

        peer.set_state(PeerState::Connected);
        assert!(peer.downloading());
        assert!(!peer.uploading());

        peer.set_peer_interested(true);
        peer.set_am_choking(false);
        assert!(peer.uploading());

        peer.set_state(PeerState::Disconnected);
        assert!(!peer.downloading());
        assert!(peer.peer_choking());
    }

    #[test]
    fn test_availability() {
        let peer = session();
        for _ in 0..MAX_FAILURES - 1 {
            peer.fail();
        }
        assert!(peer.available());
        peer.fail();
        assert!(!peer.available());
        peer.reset_failures();
        assert!(peer.available());
        peer.mark_unavailable();
        assert!(!peer.available());

        let portless = PeerSession::new([1u8; 20], "10.0.0.1:0".parse().unwrap());
        assert!(!portless.available());
    }

    #[test]
    fn test_stats_window() {
        let peer = session();
        peer.stats().record_download(100);
        peer.stats().record_upload(40);
        assert_eq!(peer.stats().take_window(), (100, 40));
        assert_eq!(peer.stats().take_window(), (0, 0));
        assert_eq!(peer.stats().downloaded(), 100);
        assert_eq!(peer.stats().uploaded(), 40);
    }

    #[test]
    fn test_handshake_details() {
        let peer = session();
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-qB4520-");
        peer.set_handshake(peer_id, crate::protocol::LocalCapabilities::new(true, true, false).reserved());
        assert_eq!(peer.peer_id(), Some(peer_id));
        assert_eq!(peer.client_name(), Some("qBittorrent"));
        assert!(peer.reserved().supports_dht());

        peer.set_extension_ids(vec![("ut_pex".to_string(), 4), ("ut_metadata".to_string(), 0)]);
        assert_eq!(peer.extension_id("ut_pex"), Some(4));
        assert_eq!(peer.extension_id("ut_metadata"), None);
    }

    #[test]
    fn test_pex_flags_and_address() {
        let peer = session();
        peer.set_pex_flags(FLAG_SEED | FLAG_UTP);
        assert!(peer.is_upload_only());
        peer.set_encrypted(true);
        peer.set_outgoing(true);
        assert_eq!(peer.advertised_pex_flags(), FLAG_SEED | FLAG_UTP | FLAG_ENCRYPTION | FLAG_OUTGOING);

        assert_eq!(peer.pex_addr(), peer.addr());
        peer.set_listen_port(51413);
        assert_eq!(peer.pex_addr(), "127.0.0.1:51413".parse().unwrap());
    }

    #[test]
    fn test_snapshot_serializes() {
        let peer = session();
        peer.add_source(PeerSource::Dht);
        let json = serde_json::to_string(&peer.snapshot()).unwrap();
        assert!(json.contains("\"Dht\""));
        assert!(json.contains("127.0.0.1:6881"));
    }
}
