//! UDP tracker client
//!
//! Connect, announce and scrape over one socket per tracker. A reader task
//! owns the receive side and routes every reply to the exchange waiting on
//! its transaction id, so concurrent announces for different torrents never
//! wait on each other. The connection id from a connect exchange is reused
//! for 60 seconds; every exchange is retried with a timeout of
//! 15 s * 2^attempt.

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::dht::message::parse_compact_peers;
use crate::error::TorrentError;
use crate::tracker::{parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeResponse, TrackerTransport};

pub const PROTOCOL_ID: u64 = 0x41727101980;
pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_SCRAPE: u32 = 2;
pub const ACTION_ERROR: u32 = 3;

/// How long a connection id stays valid
pub const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
/// Timeout of the first attempt, doubled on each retry
pub const UDP_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_ATTEMPTS: u32 = 3;

/// `(action, body after the transaction id)`
type Reply = (u32, Vec<u8>);
type Waiters = Arc<Mutex<HashMap<u32, oneshot::Sender<Reply>>>>;

#[derive(Default)]
struct UdpState {
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
    connection: Option<(u64, Instant)>,
}

pub struct UdpTracker {
    url: String,
    /// `host:port` of the tracker
    authority: String,
    base_timeout: Duration,
    /// Only held to read or swap the socket and connection id
    state: Mutex<UdpState>,
    waiters: Waiters,
}

impl UdpTracker {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| TorrentError::tracker_error_full("Invalid announce URL", url.clone(), e.to_string()))?;
        if parsed.scheme() != "udp" {
            return Err(TorrentError::tracker_error_with_tracker("Not a UDP tracker", url).into());
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| TorrentError::tracker_error_with_tracker("Missing tracker host", url.clone()))?;
        let port = parsed
            .port()
            .ok_or_else(|| TorrentError::tracker_error_with_tracker("Missing tracker port", url.clone()))?;
        let authority = format!("{}:{}", host, port);
        Ok(Self {
            url,
            authority,
            base_timeout: UDP_TIMEOUT,
            state: Mutex::new(UdpState::default()),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Override the first-attempt timeout
    pub fn with_timeout(mut self, base_timeout: Duration) -> Self {
        self.base_timeout = base_timeout;
        self
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut UdpState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// The shared socket, opened (and its reader started) on first use or
    /// after the reader stopped
    async fn socket(&self) -> Result<Arc<UdpSocket>> {
        let current = self.with_state(|state| match (&state.socket, &state.reader) {
            (Some(socket), Some(reader)) if !reader.is_finished() => Some(Arc::clone(socket)),
            _ => None,
        });
        if let Some(socket) = current {
            return Ok(socket);
        }

        let opened = Arc::new(self.open_socket().await?);
        Ok(self.with_state(|state| {
            if let (Some(socket), Some(reader)) = (&state.socket, &state.reader) {
                if !reader.is_finished() {
                    // another exchange won the race
                    return Arc::clone(socket);
                }
            }
            let reader = tokio::spawn(read_replies(Arc::clone(&opened), Arc::clone(&self.waiters), self.url.clone()));
            state.socket = Some(Arc::clone(&opened));
            state.reader = Some(reader);
            state.connection = None;
            opened
        }))
    }

    async fn open_socket(&self) -> Result<UdpSocket> {
        let remote = lookup_host(&self.authority)
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to resolve tracker", self.authority.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| TorrentError::network_error_with_address("Tracker host has no address", self.authority.clone()))?;
        let bind: SocketAddr = if remote.is_ipv4() { "0.0.0.0:0".parse()? } else { "[::]:0".parse()? };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        debug!("UDP tracker {} resolved to {}", self.url, remote);
        Ok(socket)
    }

    /// Send `packet` and wait for the reply carrying `transaction_id`
    async fn exchange(&self, socket: &UdpSocket, packet: &[u8], transaction_id: u32, action: u32) -> Result<Vec<u8>> {
        let (tx, mut rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(transaction_id, tx);
        let result = self.await_reply(socket, packet, &mut rx).await;
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&transaction_id);

        match result? {
            (ACTION_ERROR, message) => {
                Err(TorrentError::tracker_error_with_tracker(String::from_utf8_lossy(&message), self.url.clone()).into())
            }
            (got, body) if got == action => Ok(body),
            (got, _) => Err(TorrentError::tracker_error_with_tracker(
                format!("Unexpected action {} (wanted {})", got, action),
                self.url.clone(),
            )
            .into()),
        }
    }

    async fn await_reply(&self, socket: &UdpSocket, packet: &[u8], rx: &mut oneshot::Receiver<Reply>) -> Result<Reply> {
        for attempt in 0..MAX_ATTEMPTS {
            socket.send(packet).await?;
            let wait = self.base_timeout * (1 << attempt);
            match timeout(wait, &mut *rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => {
                    return Err(TorrentError::network_error_with_address("Tracker socket closed", self.authority.clone()).into())
                }
                Err(_) => debug!("UDP tracker {} attempt {} timed out after {:?}", self.url, attempt + 1, wait),
            }
        }
        Err(TorrentError::timeout_with_target("UDP tracker exchange", self.url.clone()).into())
    }

    /// Cached connection id, or a fresh connect exchange
    async fn connection_id(&self, socket: &UdpSocket) -> Result<u64> {
        let cached = self.with_state(|state| state.connection.filter(|(_, at)| at.elapsed() < CONNECTION_ID_TTL));
        if let Some((id, _)) = cached {
            return Ok(id);
        }

        let transaction_id: u32 = rand::random();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(PROTOCOL_ID);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(transaction_id);

        let body = self.exchange(socket, &packet, transaction_id, ACTION_CONNECT).await?;
        if body.len() < 8 {
            return Err(TorrentError::tracker_error_with_tracker("Short connect response", self.url.clone()).into());
        }
        let id = (&body[..8]).get_u64();
        self.with_state(|state| state.connection = Some((id, Instant::now())));
        trace!("UDP tracker {} connection id {:#x}", self.url, id);
        Ok(id)
    }

    /// Run one request that needs a connection id; a failure drops the id
    async fn request<F>(&self, action: u32, build: F) -> Result<(Vec<u8>, bool)>
    where
        F: FnOnce(&mut BytesMut),
    {
        let socket = self.socket().await?;
        let ipv6 = socket.peer_addr().map_or(false, |addr| addr.is_ipv6());
        let connection_id = self.connection_id(&socket).await?;
        let transaction_id: u32 = rand::random();
        let mut packet = BytesMut::with_capacity(100);
        packet.put_u64(connection_id);
        packet.put_u32(action);
        packet.put_u32(transaction_id);
        build(&mut packet);

        let result = self.exchange(&socket, &packet, transaction_id, action).await;
        if result.is_err() {
            self.with_state(|state| {
                if state.connection.map_or(false, |(id, _)| id == connection_id) {
                    state.connection = None;
                }
            });
        }
        result.map(|body| (body, ipv6))
    }
}

/// Receive side of a tracker socket: hand each reply to its waiter
async fn read_replies(socket: Arc<UdpSocket>, waiters: Waiters, url: String) {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("UDP tracker {} receive failed: {}", url, e);
                return;
            }
        };
        let mut reply = &buf[..n];
        if reply.len() < 8 {
            trace!("Short datagram from tracker {}", url);
            continue;
        }
        let action = reply.get_u32();
        let transaction_id = reply.get_u32();
        let waiter = waiters.lock().unwrap_or_else(PoisonError::into_inner).remove(&transaction_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send((action, reply.to_vec()));
            }
            None => trace!("Stale transaction {:#x} from tracker {}", transaction_id, url),
        }
    }
}

impl Drop for UdpTracker {
    fn drop(&mut self) {
        if let Some(reader) = self.with_state(|state| state.reader.take()) {
            reader.abort();
        }
    }
}

#[async_trait]
impl TrackerTransport for UdpTracker {
    fn url(&self) -> &str {
        &self.url
    }

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        debug!("UDP announce ({}) to {}", request.event, self.url);
        let (body, ipv6) = self
            .request(ACTION_ANNOUNCE, |packet| {
                packet.put_slice(&request.info_hash);
                packet.put_slice(&request.peer_id);
                packet.put_u64(request.downloaded);
                packet.put_u64(request.left);
                packet.put_u64(request.uploaded);
                packet.put_u32(request.event.udp_id());
                packet.put_u32(0);
                packet.put_u32(request.key);
                packet.put_i32(request.numwant);
                packet.put_u16(request.port);
            })
            .await?;
        if body.len() < 12 {
            return Err(TorrentError::tracker_error_with_tracker("Short announce response", self.url.clone()).into());
        }
        let mut reply = &body[..];
        let interval = reply.get_u32();
        let leechers = reply.get_u32();
        let seeders = reply.get_u32();
        let peers = if ipv6 { parse_compact_peers6(reply)? } else { parse_compact_peers(reply)? };
        Ok(AnnounceResponse {
            interval,
            complete: Some(seeders),
            incomplete: Some(leechers),
            peers,
            ..AnnounceResponse::default()
        })
    }

    async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeResponse> {
        let (body, _) = self.request(ACTION_SCRAPE, |packet| packet.put_slice(info_hash)).await?;
        if body.len() < 12 {
            return Err(TorrentError::tracker_error_with_tracker("Short scrape response", self.url.clone()).into());
        }
        let mut reply = &body[..];
        Ok(ScrapeResponse { complete: reply.get_u32(), downloaded: reply.get_u32(), incomplete: reply.get_u32() })
    }
}

impl std::fmt::Debug for UdpTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTracker").field("url", &self.url).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use crate::tracker::TrackerEvent;

    /// Minimal tracker: answers connect, announce and scrape; counts connects
    async fn mock_tracker(fail_announce: bool) -> (String, Arc<AtomicU32>, Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let connects = Arc::new(AtomicU32::new(0));
        let announces = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (c, a) = (Arc::clone(&connects), Arc::clone(&announces));
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let mut packet = &buf[..n];
                let connection_id = packet.get_u64();
                let action = packet.get_u32();
                let tid = packet.get_u32();
                let mut reply = BytesMut::new();
                match action {
                    ACTION_CONNECT => {
                        assert_eq!(connection_id, PROTOCOL_ID);
                        c.fetch_add(1, Ordering::SeqCst);
                        reply.put_u32(ACTION_CONNECT);
                        reply.put_u32(tid);
                        reply.put_u64(0xfeed);
                    }
                    // never answers this torrent
                    ACTION_ANNOUNCE if n >= 36 && buf[16..36] == [1u8; 20] => continue,
                    ACTION_ANNOUNCE if fail_announce => {
                        reply.put_u32(ACTION_ERROR);
                        reply.put_u32(tid);
                        reply.put_slice(b"torrent not registered");
                    }
                    ACTION_ANNOUNCE => {
                        assert_eq!(connection_id, 0xfeed);
                        a.lock().unwrap().push(buf[..n].to_vec());
                        reply.put_u32(ACTION_ANNOUNCE);
                        reply.put_u32(tid);
                        reply.put_u32(1200);
                        reply.put_u32(3);
                        reply.put_u32(7);
                        reply.put_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
                    }
                    ACTION_SCRAPE => {
                        reply.put_u32(ACTION_SCRAPE);
                        reply.put_u32(tid);
                        reply.put_u32(7);
                        reply.put_u32(20);
                        reply.put_u32(3);
                    }
                    _ => continue,
                }
                socket.send_to(&reply, from).await.unwrap();
            }
        });
        (format!("udp://{}/announce", addr), connects, announces)
    }

    #[tokio::test]
    async fn test_announce_reuses_connection_id() {
        let (url, connects, announces) = mock_tracker(false).await;
        let tracker = UdpTracker::new(url).unwrap();
        let request = AnnounceRequest::new([9u8; 20], [1u8; 20], 6881)
            .with_event(TrackerEvent::Started)
            .with_transfer(10, 20, 30);

        let response = tracker.announce(&request).await.unwrap();
        assert_eq!(response.interval, 1200);
        assert_eq!(response.incomplete, Some(3));
        assert_eq!(response.complete, Some(7));
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        tracker.announce(&request).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        let packets = announces.lock().unwrap();
        assert_eq!(packets.len(), 2);
        let packet = &packets[0];
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[16..36], &[9u8; 20]);
        assert_eq!((&packet[56..64]).get_u64(), 20);
        assert_eq!((&packet[64..72]).get_u64(), 30);
        assert_eq!((&packet[72..80]).get_u64(), 10);
        assert_eq!((&packet[80..84]).get_u32(), TrackerEvent::Started.udp_id());
        assert_eq!((&packet[96..98]).get_u16(), 6881);
    }

    #[tokio::test]
    async fn test_scrape() {
        let (url, _, _) = mock_tracker(false).await;
        let tracker = UdpTracker::new(url).unwrap();
        let scrape = tracker.scrape(&[9u8; 20]).await.unwrap();
        assert_eq!(scrape, ScrapeResponse { complete: 7, downloaded: 20, incomplete: 3 });
    }

    #[tokio::test]
    async fn test_error_action_surfaces_message() {
        let (url, _, _) = mock_tracker(true).await;
        let tracker = UdpTracker::new(url).unwrap();
        let err = tracker.announce(&AnnounceRequest::new([9u8; 20], [1u8; 20], 6881)).await.unwrap_err();
        match crate::error::kind_of(&err) {
            Some(TorrentError::TrackerError { message, .. }) => assert_eq!(message, "torrent not registered"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_tracker_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}", silent.local_addr().unwrap());
        let tracker = UdpTracker::new(url).unwrap().with_timeout(Duration::from_millis(20));
        let started = Instant::now();
        let err = tracker.announce(&AnnounceRequest::new([9u8; 20], [1u8; 20], 6881)).await.unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(TorrentError::Timeout { .. })));
        // 20 + 40 + 80 ms
        assert!(started.elapsed() >= Duration::from_millis(140));
        drop(silent);
    }

    #[tokio::test]
    async fn test_stalled_announce_does_not_block_other_torrents() {
        let (url, connects, _) = mock_tracker(false).await;
        let tracker = Arc::new(UdpTracker::new(url).unwrap().with_timeout(Duration::from_millis(200)));

        let stalled = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.announce(&AnnounceRequest::new([1u8; 20], [1u8; 20], 6881)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let response = tracker.announce(&AnnounceRequest::new([9u8; 20], [1u8; 20], 6881)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(response.interval, 1200);
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        let err = stalled.await.unwrap().unwrap_err();
        assert!(matches!(crate::error::kind_of(&err), Some(TorrentError::Timeout { .. })));
    }

    #[test]
    fn test_url_validation() {
        assert!(UdpTracker::new("udp://tracker.example:6969/announce").is_ok());
        assert!(UdpTracker::new("udp://tracker.example/announce").is_err());
        assert!(UdpTracker::new("http://tracker.example:80/announce").is_err());
    }
}
