//! Peer manager module
//!
//! The peer registry shared by every torrent. Per info-hash it keeps a
//! lookup table of sessions keyed by host, a recency queue used to pick the
//! next peer to connect to, and the set of peers holding an upload slot.
//! Live connections are reached through command channels.
//!
//! Lock ordering: the swarm map and the connection map are never locked at
//! the same time.

use crate::peer::state::{PeerSession, PeerSource, PeerState};
use crate::protocol::extension::ExtensionType;
use crate::protocol::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

/// Default upload slot ceiling per torrent
pub const DEFAULT_UPLOAD_SLOTS: usize = 8;

/// Instruction for a connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Send a peer-wire message
    Wire(Message),
    /// Send an extension message under the peer's id for `ext`
    Extension { ext: ExtensionType, payload: Vec<u8> },
    /// Send a PEX update if one is due
    Exchange,
    /// Close the connection
    Close,
}

/// Channel into a connection task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub session: Arc<PeerSession>,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl ConnectionHandle {
    pub fn new(session: Arc<PeerSession>, tx: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self { session, tx }
    }

    /// `false` when the task has already exited
    pub fn send(&self, command: PeerCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[derive(Debug, Default)]
struct Swarm {
    sessions: HashMap<IpAddr, Arc<PeerSession>>,
    queue: VecDeque<Arc<PeerSession>>,
    uploaders: HashSet<IpAddr>,
}

impl Swarm {
    fn remove_from_queue(&mut self, host: IpAddr) {
        self.queue.retain(|p| p.addr().ip() != host);
    }
}

/// Result of one optimization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub evicted: Vec<SocketAddr>,
    pub demoted: Vec<SocketAddr>,
}

/// Registry of every peer of every torrent
#[derive(Debug)]
pub struct PeerManager {
    swarms: Mutex<HashMap<[u8; 20], Swarm>>,
    connections: Mutex<HashMap<([u8; 20], IpAddr), ConnectionHandle>>,
    upload_slots: usize,
}

impl PeerManager {
    /// Create a registry with the given upload slot ceiling per torrent
    pub fn new(upload_slots: usize) -> Self {
        Self { swarms: Mutex::new(HashMap::new()), connections: Mutex::new(HashMap::new()), upload_slots }
    }

    pub fn upload_slots(&self) -> usize {
        self.upload_slots
    }

    /// Session for `addr`, created on first sight
    ///
    /// Sessions are deduplicated by host; a later sighting only adds its
    /// source bit.
    pub async fn new_peer_session(&self, info_hash: [u8; 20], addr: SocketAddr, source: PeerSource) -> Arc<PeerSession> {
        let mut swarms = self.swarms.lock().await;
        let swarm = swarms.entry(info_hash).or_default();

        if let Some(existing) = swarm.sessions.get(&addr.ip()) {
            existing.add_source(source);
            trace!("Peer {} already known, added source {:?}", addr, source);
            return Arc::clone(existing);
        }

        let session = Arc::new(PeerSession::new(info_hash, addr));
        session.add_source(source);
        swarm.sessions.insert(addr.ip(), Arc::clone(&session));
        swarm.queue.push_back(Arc::clone(&session));
        debug!("Added peer {} via {:?} (total: {})", addr, source, swarm.sessions.len());
        session
    }

    /// Session known for the host of `addr`
    pub async fn find(&self, info_hash: &[u8; 20], addr: &SocketAddr) -> Option<Arc<PeerSession>> {
        let swarms = self.swarms.lock().await;
        swarms.get(info_hash)?.sessions.get(&addr.ip()).cloned()
    }

    /// Every session of a torrent
    pub async fn sessions(&self, info_hash: &[u8; 20]) -> Vec<Arc<PeerSession>> {
        let swarms = self.swarms.lock().await;
        swarms.get(info_hash).map(|s| s.sessions.values().cloned().collect()).unwrap_or_default()
    }

    pub async fn peer_count(&self, info_hash: &[u8; 20]) -> usize {
        let swarms = self.swarms.lock().await;
        swarms.get(info_hash).map_or(0, |s| s.sessions.len())
    }

    /// Connectable addresses, most recent first
    pub async fn available_peers(&self, info_hash: &[u8; 20], limit: usize) -> Vec<SocketAddr> {
        let swarms = self.swarms.lock().await;
        let Some(swarm) = swarms.get(info_hash) else {
            return Vec::new();
        };
        swarm.queue.iter().rev().filter(|p| p.available()).map(|p| p.pex_addr()).take(limit).collect()
    }

    /// Take the most recent connectable peer off the queue
    ///
    /// Peers found unavailable or already connected go back to the head.
    pub async fn pick(&self, info_hash: &[u8; 20]) -> Option<Arc<PeerSession>> {
        let mut swarms = self.swarms.lock().await;
        let swarm = swarms.get_mut(info_hash)?;

        for _ in 0..swarm.queue.len() {
            let peer = swarm.queue.pop_back()?;
            if peer.available() && peer.state() == PeerState::Disconnected {
                return Some(peer);
            }
            swarm.queue.push_front(peer);
        }
        None
    }

    /// Move a peer to the tail, next in line for `pick`
    pub async fn preference(&self, peer: &Arc<PeerSession>) {
        let mut swarms = self.swarms.lock().await;
        if let Some(swarm) = swarms.get_mut(&peer.info_hash()) {
            swarm.remove_from_queue(peer.addr().ip());
            swarm.queue.push_back(Arc::clone(peer));
        }
    }

    /// Move a peer to the head, first in line for eviction
    pub async fn inferior(&self, peer: &Arc<PeerSession>) {
        let mut swarms = self.swarms.lock().await;
        if let Some(swarm) = swarms.get_mut(&peer.info_hash()) {
            swarm.remove_from_queue(peer.addr().ip());
            swarm.queue.push_front(Arc::clone(peer));
        }
    }

    /// Grant an upload slot
    ///
    /// Download partners are always admitted; anyone else only while fewer
    /// than the ceiling of available peers hold a slot.
    pub async fn admit_for_upload(&self, peer: &Arc<PeerSession>) -> bool {
        let mut swarms = self.swarms.lock().await;
        let swarm = swarms.entry(peer.info_hash()).or_default();
        let host = peer.addr().ip();

        if swarm.uploaders.contains(&host) {
            return true;
        }
        let active = swarm
            .uploaders
            .iter()
            .filter(|h| swarm.sessions.get(*h).is_some_and(|p| p.available()))
            .count();
        if peer.downloading() || active < self.upload_slots {
            swarm.uploaders.insert(host);
            trace!("Upload slot granted to {} ({}/{})", peer.addr(), active + 1, self.upload_slots);
            true
        } else {
            trace!("Upload slot refused to {} ({}/{})", peer.addr(), active, self.upload_slots);
            false
        }
    }

    /// Give an upload slot back
    pub async fn release_upload(&self, peer: &PeerSession) {
        let mut swarms = self.swarms.lock().await;
        if let Some(swarm) = swarms.get_mut(&peer.info_hash()) {
            swarm.uploaders.remove(&peer.addr().ip());
        }
    }

    pub async fn upload_count(&self, info_hash: &[u8; 20]) -> usize {
        let swarms = self.swarms.lock().await;
        swarms.get(info_hash).map_or(0, |s| s.uploaders.len())
    }

    /// Periodic pass over a torrent's peers
    ///
    /// Unavailable peers are evicted: dropped from the queue and slot set
    /// and their connections closed. Peers that moved no bytes since the
    /// previous pass lose their slot and go to the head of the queue, unless
    /// we are downloading from them. A peer's first pass only marks it.
    pub async fn optimize(&self, info_hash: &[u8; 20]) -> OptimizeReport {
        let mut report = OptimizeReport::default();
        let mut to_close = Vec::new();
        {
            let mut swarms = self.swarms.lock().await;
            let Some(swarm) = swarms.get_mut(info_hash) else {
                return report;
            };
            let sessions: Vec<Arc<PeerSession>> = swarm.sessions.values().cloned().collect();

            for peer in sessions {
                let host = peer.addr().ip();
                if !peer.available() {
                    let queued = swarm.queue.iter().any(|p| p.addr().ip() == host);
                    if queued || swarm.uploaders.contains(&host) || peer.state() != PeerState::Disconnected {
                        swarm.remove_from_queue(host);
                        swarm.uploaders.remove(&host);
                        to_close.push(host);
                        report.evicted.push(peer.addr());
                    }
                    continue;
                }
                if !peer.connected() {
                    continue;
                }

                let (downloaded, uploaded) = peer.stats().take_window();
                if !peer.stats().is_marked() {
                    peer.stats().mark();
                    continue;
                }
                if downloaded == 0 && uploaded == 0 && !peer.downloading() {
                    swarm.uploaders.remove(&host);
                    swarm.remove_from_queue(host);
                    swarm.queue.push_front(Arc::clone(&peer));
                    report.demoted.push(peer.addr());
                }
            }
        }

        if !to_close.is_empty() {
            let connections = self.connections.lock().await;
            for host in to_close {
                if let Some(handle) = connections.get(&(*info_hash, host)) {
                    handle.send(PeerCommand::Close);
                }
            }
        }
        if !report.evicted.is_empty() || !report.demoted.is_empty() {
            debug!(
                "Optimized {}: {} evicted, {} demoted",
                hex::encode(info_hash),
                report.evicted.len(),
                report.demoted.len()
            );
        }
        report
    }

    /// Record a live connection; `false` if the host is already connected
    pub async fn register_connection(&self, handle: ConnectionHandle) -> bool {
        let key = (handle.session.info_hash(), handle.session.addr().ip());
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&key) {
            return false;
        }
        connections.insert(key, handle);
        true
    }

    /// Forget a finished connection and free its slot
    pub async fn unregister(&self, peer: &Arc<PeerSession>) {
        self.connections.lock().await.remove(&(peer.info_hash(), peer.addr().ip()));
        peer.set_state(PeerState::Disconnected);
        self.release_upload(peer).await;
    }

    pub async fn connection_count(&self, info_hash: &[u8; 20]) -> usize {
        let connections = self.connections.lock().await;
        connections.keys().filter(|(ih, _)| ih == info_hash).count()
    }

    pub async fn is_connected(&self, info_hash: &[u8; 20], addr: &SocketAddr) -> bool {
        self.connections.lock().await.contains_key(&(*info_hash, addr.ip()))
    }

    /// Send a command to one connection
    pub async fn send(&self, info_hash: &[u8; 20], addr: &SocketAddr, command: PeerCommand) -> bool {
        let connections = self.connections.lock().await;
        connections.get(&(*info_hash, addr.ip())).is_some_and(|h| h.send(command))
    }

    fn active_partners<'a>(
        connections: &'a HashMap<([u8; 20], IpAddr), ConnectionHandle>,
        info_hash: &'a [u8; 20],
    ) -> impl Iterator<Item = &'a ConnectionHandle> + 'a {
        connections
            .iter()
            .filter(move |((ih, _), h)| ih == info_hash && (h.session.uploading() || h.session.downloading()))
            .map(|(_, h)| h)
    }

    /// Announce a completed piece to every transfer partner
    pub async fn have(&self, info_hash: &[u8; 20], piece_index: u32) -> usize {
        let connections = self.connections.lock().await;
        let mut sent = 0;
        for handle in Self::active_partners(&connections, info_hash) {
            if handle.send(PeerCommand::Wire(Message::Have { piece_index })) {
                sent += 1;
            }
        }
        trace!("Have {} sent to {} peers", piece_index, sent);
        sent
    }

    /// Ask every transfer partner's connection to send a PEX update
    pub async fn exchange(&self, info_hash: &[u8; 20]) -> usize {
        let connections = self.connections.lock().await;
        Self::active_partners(&connections, info_hash)
            .filter(|h| h.send(PeerCommand::Exchange))
            .count()
    }

    /// Send a command to every connection of a torrent
    pub async fn broadcast(&self, info_hash: &[u8; 20], command: PeerCommand) -> usize {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .filter(|((ih, _), _)| ih == info_hash)
            .filter(|(_, h)| h.send(command.clone()))
            .count()
    }

    /// Connected peers worth advertising to `exclude`
    pub async fn pex_candidates(&self, info_hash: &[u8; 20], exclude: IpAddr) -> Vec<(SocketAddr, u8)> {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .filter(|((ih, host), h)| ih == info_hash && *host != exclude && h.session.connected())
            .map(|(_, h)| (h.session.pex_addr(), h.session.advertised_pex_flags()))
            .collect()
    }

    /// Drop a torrent's peers and close its connections
    pub async fn remove_torrent(&self, info_hash: &[u8; 20]) {
        let removed = self.swarms.lock().await.remove(info_hash);
        let mut connections = self.connections.lock().await;
        connections.retain(|(ih, _), handle| {
            if ih == info_hash {
                handle.send(PeerCommand::Close);
                false
            } else {
                true
            }
        });
        if let Some(swarm) = removed {
            info!("Removed {} peers of {}", swarm.sessions.len(), hex::encode(info_hash));
        }
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_SLOTS)
    }
}
