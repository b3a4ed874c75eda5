//! DHT main module
//!
//! The DHT node: one UDP socket, the routing table, in-flight request
//! correlation and the responders for incoming queries.

use crate::bencode::BencodeDict;
use crate::dht::message::{
    parse_compact_nodes, parse_peer_values, peer_values, serialize_compact_nodes, DhtMessage,
    QueryType, ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL,
};
use crate::dht::node::{NodeId, NodeSession};
use crate::dht::request::{PendingRequests, RequestOutcome, REQUEST_TIMEOUT};
use crate::dht::routing::{RoutingTable, K};
use crate::dht::token::TokenManager;
use crate::error::TorrentError;
use crate::peer::{PeerManager, PeerSource};
use crate::torrent::TorrentManager;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

/// Maximum peers returned in a get_peers `values` list
const MAX_PEER_VALUES: usize = 50;

/// Reply to a get_peers query
#[derive(Debug, Clone, Default)]
pub struct GetPeersReply {
    /// Token to echo in a later announce_peer
    pub token: Option<Vec<u8>>,
    /// Peers serving the info-hash
    pub peers: Vec<SocketAddr>,
    /// Closer nodes, when the responder has no peers
    pub nodes: Vec<(NodeId, SocketAddr)>,
}

/// Main DHT struct
pub struct DHT {
    /// Routing table
    pub routing_table: Arc<RwLock<RoutingTable>>,
    /// UDP socket for DHT communication
    socket: Arc<UdpSocket>,
    /// Our node ID
    pub our_id: NodeId,
    /// Requests waiting for a reply
    pending: Arc<PendingRequests>,
    tokens: Mutex<TokenManager>,
    /// Receives peers announced to us
    peer_manager: Arc<PeerManager>,
    /// Torrents we serve
    torrents: Arc<TorrentManager>,
    /// Local address
    pub local_addr: SocketAddr,
    running: AtomicBool,
    shutdown: Notify,
    request_timeout: Duration,
}

impl DHT {
    /// Create a new DHT instance
    pub async fn new(
        bind_addr: SocketAddr,
        peer_manager: Arc<PeerManager>,
        torrents: Arc<TorrentManager>,
    ) -> Result<Self> {
        Self::with_id(bind_addr, NodeId::random(), peer_manager, torrents).await
    }

    /// Create a DHT instance with a fixed node id
    pub async fn with_id(
        bind_addr: SocketAddr,
        our_id: NodeId,
        peer_manager: Arc<PeerManager>,
        torrents: Arc<TorrentManager>,
    ) -> Result<Self> {
        info!("Creating DHT instance on {}", bind_addr);

        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind UDP socket to {}: {}", bind_addr, e);
            TorrentError::network_error_full("Failed to bind UDP socket", bind_addr.to_string(), e.to_string())
        })?;
        let local_addr = socket.local_addr().map_err(|e| {
            error!("Failed to get local address: {}", e);
            TorrentError::network_error_full("Failed to get local address", "unknown".to_string(), e.to_string())
        })?;

        info!("DHT initialized with ID: {}", our_id.to_hex());
        info!("DHT listening on: {}", local_addr);

        Ok(Self {
            routing_table: Arc::new(RwLock::new(RoutingTable::new(our_id))),
            socket: Arc::new(socket),
            our_id,
            pending: Arc::new(PendingRequests::new()),
            tokens: Mutex::new(TokenManager::new()),
            peer_manager,
            torrents,
            local_addr,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Spawn the receive loop
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("DHT is already running");
            return Err(TorrentError::dht_error("DHT is already running").into());
        }
        info!("Starting DHT service on {}", self.local_addr);
        let dht = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if let Err(e) = dht.run_loop().await {
                error!("DHT event loop failed: {}", e);
            }
        }))
    }

    /// Stop DHT service
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        info!("DHT service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Main DHT event loop
    pub async fn run_loop(self: Arc<Self>) -> Result<()> {
        info!("Starting DHT event loop");

        let mut buffer = vec![0u8; 65536];
        let mut cleanup_interval = interval(Duration::from_secs(60));
        let mut refresh_interval = interval(Duration::from_secs(300));

        while self.is_running() {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => {
                            if let Err(e) = self.handle_message(&buffer[..len], from).await {
                                debug!("Dropped DHT datagram from {}: {}", from, e);
                            }
                        }
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_transactions().await;
                }
                _ = refresh_interval.tick() => {
                    // Replies are read by this loop, so queries run elsewhere
                    let dht = Arc::clone(&self);
                    tokio::spawn(async move { dht.refresh_buckets().await });
                }
                _ = self.shutdown.notified() => {
                    break;
                }
            }
        }

        info!("DHT event loop stopped");
        Ok(())
    }

    /// Handle incoming DHT datagram
    pub async fn handle_message(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        trace!("Handling message from {} ({} bytes)", from, data.len());
        let message = match DhtMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed DHT message from {}: {}", from, e);
                let mut table = self.routing_table.write().await;
                if let Some(id) = table.find_by_addr(&from).map(|n| n.id) {
                    table.record_failure(&id);
                }
                return Err(e);
            }
        };

        match message {
            DhtMessage::Query { .. } => self.handle_query(message, from).await,
            DhtMessage::Response { .. } | DhtMessage::Error { .. } => {
                if let DhtMessage::Error { code, message: text, .. } = &message {
                    debug!("Received error from {}: code={}, message={}", from, code, text);
                }
                if self.pending.resolve(message).is_none() {
                    debug!("Discarded reply from {} with unknown transaction id", from);
                }
                Ok(())
            }
        }
    }

    async fn reply(&self, message: DhtMessage, to: SocketAddr) -> Result<()> {
        self.socket.send_to(&message.encode(), to).await.map_err(|e| {
            error!("Failed to send DHT reply to {}: {}", to, e);
            TorrentError::network_error_full("Failed to send DHT reply", to.to_string(), e.to_string())
        })?;
        Ok(())
    }

    async fn reply_error(&self, transaction_id: &[u8], code: i64, text: &str, to: SocketAddr) -> Result<()> {
        warn!("Rejecting DHT query from {}: {} ({})", to, text, code);
        self.reply(DhtMessage::error(transaction_id, code, text), to).await
    }

    /// Handle incoming query
    async fn handle_query(&self, message: DhtMessage, from: SocketAddr) -> Result<()> {
        let DhtMessage::Query { transaction_id, method, args } = &message else {
            return Ok(());
        };

        let Some(sender) = message.sender_id() else {
            return self.reply_error(transaction_id, ERROR_PROTOCOL, "Missing node id", from).await;
        };

        let Some(query_type) = QueryType::from_name(method) else {
            return self
                .reply_error(transaction_id, ERROR_METHOD_UNKNOWN, "Method Unknown", from)
                .await;
        };

        debug!("Received {} query from {}", query_type, from);
        self.routing_table.write().await.record_query(sender, from);

        let values = match query_type {
            QueryType::Ping => BencodeDict::new(),
            QueryType::FindNode => {
                let Some(target) = args.get_bytes("target").and_then(NodeId::from_slice) else {
                    return self.reply_error(transaction_id, ERROR_PROTOCOL, "Invalid target", from).await;
                };
                BencodeDict::new().with("nodes", self.compact_closest(&target).await)
            }
            QueryType::GetPeers => {
                let Some(info_hash) = args.get_bytes("info_hash").and_then(info_hash_from) else {
                    return self.reply_error(transaction_id, ERROR_PROTOCOL, "Invalid info_hash", from).await;
                };
                self.get_peers_values(info_hash, from).await
            }
            QueryType::AnnouncePeer => {
                let Some(info_hash) = args.get_bytes("info_hash").and_then(info_hash_from) else {
                    return self.reply_error(transaction_id, ERROR_PROTOCOL, "Invalid info_hash", from).await;
                };
                let token = args.get_bytes("token").unwrap_or_default();
                let valid = self
                    .tokens
                    .lock()
                    .map(|mut tokens| tokens.validate(&from.ip(), token))
                    .unwrap_or(false);
                if !valid {
                    return self.reply_error(transaction_id, ERROR_PROTOCOL, "Bad token", from).await;
                }

                let implied = args.get_integer("implied_port").unwrap_or(0) == 1;
                let port = if implied {
                    from.port()
                } else {
                    match args.get_integer("port").and_then(|p| u16::try_from(p).ok()) {
                        Some(port) if port != 0 => port,
                        _ => return self.reply_error(transaction_id, ERROR_PROTOCOL, "Invalid port", from).await,
                    }
                };

                if self.torrents.contains(&info_hash).await {
                    let peer_addr = SocketAddr::new(from.ip(), port);
                    self.peer_manager.new_peer_session(info_hash, peer_addr, PeerSource::Dht).await;
                    debug!("Accepted DHT announce for {} from {}", hex::encode(info_hash), peer_addr);
                }
                BencodeDict::new()
            }
        };

        self.reply(DhtMessage::response(transaction_id, self.our_id, values), from).await
    }

    async fn compact_closest(&self, target: &NodeId) -> Vec<u8> {
        let closest = self.routing_table.read().await.find_closest(target, K);
        serialize_compact_nodes(closest.iter().map(|n| (&n.id, &n.addr)))
    }

    /// Token plus either peer values or closest nodes, never both
    async fn get_peers_values(&self, info_hash: [u8; 20], from: SocketAddr) -> BencodeDict {
        let token = self
            .tokens
            .lock()
            .map(|mut tokens| tokens.generate(&from.ip()))
            .unwrap_or_default();
        let mut values = BencodeDict::new().with("token", token);

        // The registry lock is released before the routing table is touched
        let peers = if self.torrents.contains(&info_hash).await {
            self.peer_manager.available_peers(&info_hash, MAX_PEER_VALUES).await
        } else {
            Vec::new()
        };

        if peers.is_empty() {
            values.insert("nodes", self.compact_closest(&NodeId::from(info_hash)).await);
        } else {
            values.insert("values", peer_values(&peers));
        }
        values
    }

    /// Send a query and wait for its reply
    ///
    /// A timeout counts against the target node and is returned as
    /// `TorrentError::Timeout`; an error reply becomes `TorrentError::DHTError`.
    pub async fn send_query(&self, addr: SocketAddr, node_id: Option<NodeId>, mut message: DhtMessage) -> Result<BencodeDict> {
        let query_type = message
            .query_type()
            .ok_or_else(|| TorrentError::dht_error("Only queries can be sent as requests"))?;

        let (transaction_id, slot) = self.pending.register(addr, node_id, query_type);
        message.set_transaction_id(transaction_id.clone());

        if let Some(id) = node_id {
            self.routing_table.write().await.mark_verifying(&id);
        }

        if let Err(e) = self.socket.send_to(&message.encode(), addr).await {
            self.pending.cancel(&transaction_id);
            error!("Failed to send {} to {}: {}", query_type, addr, e);
            return Err(TorrentError::network_error_full("Failed to send query", addr.to_string(), e.to_string()).into());
        }
        trace!("Sent {} to {}", query_type, addr);

        match slot.wait(self.request_timeout).await {
            RequestOutcome::Answered(DhtMessage::Response { values, .. }) => {
                if let Some(id) = values.get_bytes("id").and_then(NodeId::from_slice) {
                    self.routing_table.write().await.record_response(id, addr);
                }
                Ok(values)
            }
            RequestOutcome::Answered(DhtMessage::Error { code, message, .. }) => Err(TorrentError::dht_error_full(
                format!("{} rejected with code {}", query_type, code),
                addr.to_string(),
                message,
            )
            .into()),
            RequestOutcome::Answered(DhtMessage::Query { .. }) => {
                Err(TorrentError::dht_error_with_node("Unexpected query as reply", addr.to_string()).into())
            }
            RequestOutcome::TimedOut => {
                self.pending.cancel(&transaction_id);
                if let Some(id) = node_id {
                    self.routing_table.write().await.record_failure(&id);
                }
                debug!("{} to {} timed out", query_type, addr);
                Err(TorrentError::timeout_with_target(query_type.as_str(), addr.to_string()).into())
            }
        }
    }

    /// Ping a node, returning its id
    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId> {
        let node_id = self.routing_table.read().await.find_by_addr(&addr).map(|n| n.id);
        let values = self.send_query(addr, node_id, DhtMessage::ping(self.our_id)).await?;
        values
            .get_bytes("id")
            .and_then(NodeId::from_slice)
            .ok_or_else(|| TorrentError::malformed("Ping response without node id").into())
    }

    /// Ask a node for the nodes closest to `target`
    pub async fn find_node(&self, node: &NodeSession, target: NodeId) -> Result<Vec<(NodeId, SocketAddr)>> {
        let values = self
            .send_query(node.addr, Some(node.id), DhtMessage::find_node(self.our_id, target))
            .await?;
        let nodes = parse_compact_nodes(values.get_bytes("nodes").unwrap_or_default())?;
        self.learn_nodes(&nodes).await;
        Ok(nodes)
    }

    /// Ask a node for peers of `info_hash`
    pub async fn get_peers(&self, node: &NodeSession, info_hash: [u8; 20]) -> Result<GetPeersReply> {
        let values = self
            .send_query(node.addr, Some(node.id), DhtMessage::get_peers(self.our_id, info_hash))
            .await?;

        let peers = values.get_list("values").map(parse_peer_values).unwrap_or_default();
        let nodes = parse_compact_nodes(values.get_bytes("nodes").unwrap_or_default())?;
        self.learn_nodes(&nodes).await;

        Ok(GetPeersReply {
            token: values.get_bytes("token").map(<[u8]>::to_vec),
            peers,
            nodes,
        })
    }

    /// Announce that we serve `info_hash` on `port`, echoing the node's token
    pub async fn announce_peer(&self, node: &NodeSession, info_hash: [u8; 20], port: u16, token: &[u8]) -> Result<()> {
        self.send_query(
            node.addr,
            Some(node.id),
            DhtMessage::announce_peer(self.our_id, info_hash, port, token, false),
        )
        .await?;
        Ok(())
    }

    async fn learn_nodes(&self, nodes: &[(NodeId, SocketAddr)]) {
        if nodes.is_empty() {
            return;
        }
        let mut table = self.routing_table.write().await;
        for (id, addr) in nodes {
            table.record_candidate(*id, *addr);
        }
        trace!("Learned {} nodes", nodes.len());
    }

    /// Clean up expired transactions
    pub async fn cleanup_transactions(&self) {
        let expired = self.pending.sweep(self.request_timeout * 2);
        if expired.is_empty() {
            return;
        }
        let mut table = self.routing_table.write().await;
        for info in expired {
            if let Some(id) = info.node_id {
                table.record_failure(&id);
            }
        }
    }

    /// Refresh stale buckets with a find_node for a random id inside each
    pub async fn refresh_buckets(&self) {
        let (stale, table_snapshot) = {
            let table = self.routing_table.read().await;
            let stale = table.get_stale_buckets(Duration::from_secs(900));
            let targets: Vec<(NodeId, Vec<NodeSession>)> = stale
                .iter()
                .map(|&b| {
                    let target = table.random_id_in_bucket(b);
                    (target, table.find_closest(&target, 1))
                })
                .collect();
            (stale.len(), targets)
        };

        if stale == 0 {
            return;
        }
        debug!("Refreshing {} stale buckets", stale);

        for (target, nodes) in table_snapshot {
            if let Some(node) = nodes.first() {
                if let Err(e) = self.find_node(node, target).await {
                    trace!("Bucket refresh via {} failed: {}", node.addr, e);
                }
            }
        }
    }

    /// Get the number of nodes in routing table
    pub async fn node_count(&self) -> usize {
        self.routing_table.read().await.node_count()
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

fn info_hash_from(bytes: &[u8]) -> Option<[u8; 20]> {
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    async fn new_dht(torrents: Arc<TorrentManager>, peers: Arc<PeerManager>) -> Arc<DHT> {
        let mut dht = DHT::new("127.0.0.1:0".parse().unwrap(), peers, torrents).await.unwrap();
        dht.set_request_timeout(Duration::from_millis(500));
        let dht = Arc::new(dht);
        dht.start().unwrap();
        dht
    }

    async fn pair() -> (Arc<DHT>, Arc<DHT>) {
        let a = new_dht(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;
        let b = new_dht(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;
        (a, b)
    }

    #[tokio::test]
    async fn test_dht_new() {
        let dht = DHT::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PeerManager::default()),
            Arc::new(TorrentManager::new()),
        )
        .await
        .unwrap();
        assert_eq!(dht.node_count().await, 0);
        assert!(!dht.is_running());
    }

    #[tokio::test]
    async fn test_ping_adds_both_sides() {
        let (a, b) = pair().await;
        let id = a.ping(b.local_addr).await.unwrap();
        assert_eq!(id, b.our_id);
        assert!(a.routing_table.read().await.find_node(&b.our_id).is_some());
        assert!(b.routing_table.read().await.find_node(&a.our_id).is_some());
        assert_eq!(a.pending_requests(), 0);
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_find_node_returns_known_nodes() {
        let (a, b) = pair().await;
        let known = NodeId::new([7u8; 20]);
        b.routing_table
            .write()
            .await
            .record_response(known, "10.1.2.3:6881".parse().unwrap());

        let b_session = NodeSession::responded(b.our_id, b.local_addr);
        let nodes = a.find_node(&b_session, known).await.unwrap();
        assert!(nodes.iter().any(|(id, _)| *id == known));
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_announce_requires_matching_token() {
        let (a, b) = pair().await;
        let b_session = NodeSession::responded(b.our_id, b.local_addr);
        let info_hash = [9u8; 20];

        let reply = a.get_peers(&b_session, info_hash).await.unwrap();
        let token = reply.token.clone().unwrap();
        assert!(reply.peers.is_empty());

        a.announce_peer(&b_session, info_hash, 6881, &token).await.unwrap();

        let err = a.announce_peer(&b_session, info_hash, 6881, b"forged").await.unwrap_err();
        match kind_of(&err) {
            Some(TorrentError::DHTError { message, .. }) => assert!(message.contains("203")),
            other => panic!("unexpected error {:?}", other),
        }
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_timeout_counts_failure() {
        let (a, _b) = pair().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let silent_id = NodeId::new([3u8; 20]);
        a.routing_table.write().await.record_response(silent_id, silent_addr);

        let session = NodeSession::responded(silent_id, silent_addr);
        let err = a.find_node(&session, NodeId::random()).await.unwrap_err();
        assert!(matches!(kind_of(&err), Some(TorrentError::Timeout { .. })));
        assert_eq!(a.routing_table.read().await.find_node(&silent_id).unwrap().failed_queries, 1);
        assert_eq!(a.pending_requests(), 0);
        a.stop();
    }

    #[tokio::test]
    async fn test_unknown_method_gets_204() {
        let (a, _b) = pair().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"d1:t2:aa1:y1:q1:q4:vote1:ad2:id20:aaaaaaaaaaaaaaaaaaaaee", a.local_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match DhtMessage::decode(&buf[..len]).unwrap() {
            DhtMessage::Error { code, transaction_id, .. } => {
                assert_eq!(code, ERROR_METHOD_UNKNOWN);
                assert_eq!(transaction_id, b"aa");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        a.stop();
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let (a, _b) = pair().await;
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(a.handle_message(b"not bencode", from).await.is_err());
        assert_eq!(a.node_count().await, 0);
        a.stop();
    }
}
