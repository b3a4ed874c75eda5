//! Local service discovery (BEP 14)
//!
//! Torrents are announced as `BT-SEARCH` datagrams to the multicast group
//! 239.192.152.143:6771. Announces from other clients on the LAN are
//! matched against the torrent registry and their senders enter the peer
//! registry with source `Lsd`.

use anyhow::Result;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::{PeerManager, PeerSource};
use crate::torrent::TorrentManager;

pub const LSD_HOST: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
pub const LSD_PORT: u16 = 6771;
/// Multicast hops
pub const LSD_TTL: u32 = 2;
/// Minimum gap between two announces of the same torrent
pub const MIN_ANNOUNCE_GAP: Duration = Duration::from_secs(60);

const SEARCH_LINE: &str = "BT-SEARCH * HTTP/1.1";

/// A decoded `BT-SEARCH` datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsdAnnounce {
    pub port: u16,
    pub info_hashes: Vec<[u8; 20]>,
    pub cookie: Option<String>,
}

/// Build a `BT-SEARCH` datagram
pub fn encode_search(port: u16, info_hashes: &[[u8; 20]], cookie: &str) -> Vec<u8> {
    let mut text = format!("{}\r\nHost: {}:{}\r\nPort: {}\r\n", SEARCH_LINE, LSD_HOST, LSD_PORT, port);
    for info_hash in info_hashes {
        text.push_str(&format!("Infohash: {}\r\n", hex::encode(info_hash)));
    }
    text.push_str(&format!("cookie: {}\r\n\r\n\r\n", cookie));
    text.into_bytes()
}

/// Parse a `BT-SEARCH` datagram; header names are case-insensitive
pub fn parse_search(datagram: &[u8]) -> Result<LsdAnnounce> {
    let text = std::str::from_utf8(datagram).map_err(|_| TorrentError::malformed("LSD datagram is not text"))?;
    let mut lines = text.lines();
    if !lines.next().is_some_and(|line| line.starts_with("BT-SEARCH")) {
        return Err(TorrentError::protocol_violation("Not a BT-SEARCH datagram").into());
    }

    let mut port = None;
    let mut info_hashes = Vec::new();
    let mut cookie = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "port" => {
                port = Some(
                    value
                        .parse::<u16>()
                        .ok()
                        .filter(|p| *p != 0)
                        .ok_or_else(|| TorrentError::malformed(format!("Bad LSD port '{}'", value)))?,
                );
            }
            "infohash" => {
                let mut info_hash = [0u8; 20];
                hex::decode_to_slice(value, &mut info_hash)
                    .map_err(|_| TorrentError::malformed(format!("Bad LSD info hash '{}'", value)))?;
                info_hashes.push(info_hash);
            }
            "cookie" => cookie = Some(value.to_string()),
            _ => {}
        }
    }

    let port = port.ok_or_else(|| TorrentError::malformed("LSD datagram without port"))?;
    if info_hashes.is_empty() {
        return Err(TorrentError::malformed("LSD datagram without info hash").into());
    }
    Ok(LsdAnnounce { port, info_hashes, cookie })
}

/// The LSD socket plus the bookkeeping of what was announced when
pub struct LocalDiscovery {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    listen_port: u16,
    /// Identifies our own datagrams when the group loops them back
    cookie: String,
    peers: Arc<PeerManager>,
    torrents: Arc<TorrentManager>,
    announced: Mutex<HashMap<[u8; 20], Instant>>,
    running: AtomicBool,
}

impl LocalDiscovery {
    /// Join the LSD multicast group
    pub async fn bind(listen_port: u16, peers: Arc<PeerManager>, torrents: Arc<TorrentManager>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LSD_PORT))
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to bind LSD socket", LSD_PORT.to_string(), e.to_string()))?;
        socket.join_multicast_v4(LSD_HOST, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(LSD_TTL)?;
        info!("Local service discovery on {}:{}", LSD_HOST, LSD_PORT);
        let target = SocketAddr::V4(SocketAddrV4::new(LSD_HOST, LSD_PORT));
        Ok(Arc::new(Self::with_socket(socket, target, listen_port, peers, torrents)))
    }

    /// Use an already bound socket, announcing to `target`
    pub fn with_socket(
        socket: UdpSocket,
        target: SocketAddr,
        listen_port: u16,
        peers: Arc<PeerManager>,
        torrents: Arc<TorrentManager>,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            target,
            listen_port,
            cookie: hex::encode(rand::random::<[u8; 4]>()),
            peers,
            torrents,
            announced: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the receive loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let lsd = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while lsd.running.load(Ordering::SeqCst) {
                match lsd.socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if let Err(e) = lsd.handle_datagram(&buf[..n], from).await {
                            debug!("Rejected LSD datagram from {}: {}", from, e);
                        }
                    }
                    Err(e) => {
                        warn!("LSD receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Multicast a `BT-SEARCH` for `info_hash`. Returns `false` when the
    /// torrent was announced less than a minute ago.
    pub async fn announce(&self, info_hash: &[u8; 20]) -> Result<bool> {
        let due = {
            let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
            match announced.get(info_hash) {
                Some(at) if at.elapsed() < MIN_ANNOUNCE_GAP => false,
                _ => {
                    announced.insert(*info_hash, Instant::now());
                    true
                }
            }
        };
        if !due {
            return Ok(false);
        }
        let datagram = encode_search(self.listen_port, &[*info_hash], &self.cookie);
        self.socket
            .send_to(&datagram, self.target)
            .await
            .map_err(|e| TorrentError::network_error_full("LSD announce failed", self.target.to_string(), e.to_string()))?;
        trace!("LSD announce of {}", hex::encode(info_hash));
        Ok(true)
    }

    /// Feed the peers of one datagram into the registry
    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Result<usize> {
        let announce = parse_search(datagram)?;
        if announce.cookie.as_deref() == Some(self.cookie.as_str()) {
            return Ok(0);
        }
        let addr = SocketAddr::new(from.ip(), announce.port);
        let mut added = 0;
        for info_hash in &announce.info_hashes {
            match self.torrents.get(info_hash).await {
                Some(session) if !session.is_private() => {
                    self.peers.new_peer_session(*info_hash, addr, PeerSource::Lsd).await;
                    added += 1;
                }
                Some(_) => trace!("Ignoring LSD peer {} for a private torrent", addr),
                None => trace!("LSD announce from {} for unknown torrent {}", addr, hex::encode(info_hash)),
            }
        }
        if added > 0 {
            debug!("LSD peer {} for {} torrents", addr, added);
        }
        Ok(added)
    }
}

impl std::fmt::Debug for LocalDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDiscovery")
            .field("target", &self.target)
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::tests::sample_info;
    use crate::torrent::{DiscoveryOnly, TorrentInfo};

    #[test]
    fn test_search_datagram_layout() {
        let datagram = encode_search(6881, &[[0xab; 20]], "c00k1e");
        let text = String::from_utf8(datagram.clone()).unwrap();
        assert!(text.starts_with("BT-SEARCH * HTTP/1.1\r\nHost: 239.192.152.143:6771\r\nPort: 6881\r\n"));
        assert!(text.contains(&format!("Infohash: {}\r\n", "ab".repeat(20))));
        assert!(text.ends_with("cookie: c00k1e\r\n\r\n\r\n"));

        let parsed = parse_search(&datagram).unwrap();
        assert_eq!(parsed, LsdAnnounce { port: 6881, info_hashes: vec![[0xab; 20]], cookie: Some("c00k1e".into()) });
    }

    #[test]
    fn test_parse_foreign_datagram() {
        let datagram = format!(
            "BT-SEARCH * HTTP/1.1\r\nhost: 239.192.152.143:6771\r\nPORT: 51413\r\ninfohash: {}\r\nInfohash: {}\r\n\r\n\r\n",
            "01".repeat(20),
            "02".repeat(20)
        );
        let parsed = parse_search(datagram.as_bytes()).unwrap();
        assert_eq!(parsed.port, 51413);
        assert_eq!(parsed.info_hashes, vec![[1u8; 20], [2u8; 20]]);
        assert_eq!(parsed.cookie, None);
    }

    #[test]
    fn test_parse_rejects_bad_datagrams() {
        assert!(parse_search(b"NOTIFY * HTTP/1.1\r\nPort: 1\r\n\r\n").is_err());
        assert!(parse_search(b"BT-SEARCH * HTTP/1.1\r\nInfohash: 0101\r\nPort: 1\r\n\r\n").is_err());
        assert!(parse_search(format!("BT-SEARCH * HTTP/1.1\r\nInfohash: {}\r\n\r\n", "01".repeat(20)).as_bytes()).is_err());
        assert!(parse_search(b"BT-SEARCH * HTTP/1.1\r\nPort: 6881\r\n\r\n").is_err());
        assert!(parse_search(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn test_loopback_announce_feeds_registry() {
        let peers = Arc::new(PeerManager::new(4));
        let torrents = Arc::new(TorrentManager::default());
        let info = TorrentInfo::from_info_bytes(&sample_info("lan.bin", 100, 16_384), Vec::new()).unwrap();
        let ih = info.info_hash;
        torrents.register(info, Arc::new(DiscoveryOnly)).await;

        let receiver_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver_socket.local_addr().unwrap();
        let receiver = Arc::new(LocalDiscovery::with_socket(
            receiver_socket,
            receiver_addr,
            6881,
            Arc::clone(&peers),
            Arc::clone(&torrents),
        ));
        let task = receiver.start();

        let sender = LocalDiscovery::with_socket(
            UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            receiver_addr,
            7001,
            Arc::new(PeerManager::new(4)),
            Arc::new(TorrentManager::default()),
        );
        assert!(sender.announce(&ih).await.unwrap());
        assert!(!sender.announce(&ih).await.unwrap());

        let expected: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let mut found = None;
        for _ in 0..50 {
            found = peers.find(&ih, &expected).await;
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found.unwrap().has_source(PeerSource::Lsd));

        // our own datagram comes back from the group and is skipped
        let own = encode_search(6881, &[ih], &receiver.cookie);
        assert_eq!(receiver.handle_datagram(&own, "127.0.0.1:9".parse().unwrap()).await.unwrap(), 0);
        assert_eq!(peers.peer_count(&ih).await, 1);

        receiver.stop();
        task.abort();
    }
}
