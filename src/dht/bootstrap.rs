//! DHT bootstrap module
//!
//! Joining the network through router nodes, and the iterative lookups used
//! to find peers for a torrent and announce ourselves to the nodes closest
//! to its info-hash.

use crate::dht::dht::DHT;
use crate::dht::node::{NodeId, NodeSession};
use crate::dht::routing::K;
use crate::error::TorrentError;
use anyhow::Result;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Queries in flight per lookup round
const ALPHA: usize = 3;
/// Upper bound on lookup rounds
const MAX_ROUNDS: usize = 8;

/// Bootstrap configuration
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Router nodes as `host:port`
    pub bootstrap_nodes: Vec<String>,
}

impl BootstrapConfig {
    /// Create a new bootstrap config
    pub fn new(bootstrap_nodes: Vec<String>) -> Self {
        Self { bootstrap_nodes }
    }

    /// Create a bootstrap config with default bootstrap nodes
    pub fn with_defaults() -> Self {
        Self::new(Self::default_bootstrap_nodes())
    }

    /// Well-known public router nodes
    pub fn default_bootstrap_nodes() -> Vec<String> {
        vec![
            "router.bittorrent.com:6881".to_string(),
            "dht.transmissionbt.com:6881".to_string(),
            "router.utorrent.com:6881".to_string(),
        ]
    }

    /// Resolve every router, skipping the ones that fail
    pub async fn resolve(&self) -> Vec<SocketAddr> {
        let mut resolved = Vec::new();
        for host in &self.bootstrap_nodes {
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(addrs) => resolved.extend(addrs.filter(SocketAddr::is_ipv4)),
                Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
            }
        }
        resolved
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Join the network: ping the routers, then look up our own id
///
/// Returns the number of nodes in the routing table afterwards.
pub async fn bootstrap(dht: &Arc<DHT>, config: &BootstrapConfig) -> Result<usize> {
    info!("Bootstrapping DHT network...");

    let routers = config.resolve().await;
    let mut pings = JoinSet::new();
    for addr in routers {
        let dht = Arc::clone(dht);
        pings.spawn(async move { (addr, dht.ping(addr).await) });
    }

    let mut answered = 0;
    while let Some(joined) = pings.join_next().await {
        match joined {
            Ok((addr, Ok(id))) => {
                answered += 1;
                debug!("Bootstrap node {} answered as {}", addr, id.to_hex());
            }
            Ok((addr, Err(e))) => debug!("Bootstrap node {} failed: {}", addr, e),
            Err(e) => warn!("Bootstrap ping task failed: {}", e),
        }
    }

    if answered == 0 && dht.node_count().await == 0 {
        return Err(TorrentError::dht_error("No bootstrap node answered").into());
    }

    let found = find_closest_nodes(dht, dht.our_id).await;
    let count = dht.node_count().await;
    info!("DHT bootstrapping complete: {} routers answered, {} close nodes, {} nodes known", answered, found.len(), count);
    Ok(count)
}

fn merge_candidates(shortlist: &mut Vec<NodeSession>, nodes: &[(NodeId, SocketAddr)], target: &NodeId) {
    for (id, addr) in nodes {
        if !shortlist.iter().any(|n| n.id == *id) {
            shortlist.push(NodeSession::new(*id, *addr));
        }
    }
    shortlist.sort_by(|a, b| a.distance_to(target).cmp(&b.distance_to(target)).then_with(|| a.id.cmp(&b.id)));
    shortlist.truncate(K * 4);
}

fn next_batch(shortlist: &[NodeSession], queried: &mut HashSet<SocketAddr>) -> Vec<NodeSession> {
    let batch: Vec<NodeSession> = shortlist
        .iter()
        .filter(|n| !queried.contains(&n.addr))
        .take(ALPHA)
        .cloned()
        .collect();
    for node in &batch {
        queried.insert(node.addr);
    }
    batch
}

/// Iterative find_node towards `target`
pub async fn find_closest_nodes(dht: &Arc<DHT>, target: NodeId) -> Vec<NodeSession> {
    let mut shortlist = dht.routing_table.read().await.find_closest(&target, K * 2);
    let mut queried = HashSet::new();

    for round in 0..MAX_ROUNDS {
        let batch = next_batch(&shortlist, &mut queried);
        if batch.is_empty() {
            break;
        }
        trace!("find_node round {} querying {} nodes", round, batch.len());

        let mut set = JoinSet::new();
        for node in batch {
            let dht = Arc::clone(dht);
            set.spawn(async move {
                let result = dht.find_node(&node, target).await;
                (node, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Ok((_, Ok(nodes))) = joined {
                merge_candidates(&mut shortlist, &nodes, &target);
            }
        }
    }

    shortlist.truncate(K);
    shortlist
}

/// Outcome of a get_peers lookup
#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    /// Distinct peers found
    pub peers: Vec<SocketAddr>,
    /// Nodes that handed us a token, closest first
    pub tokens: Vec<(NodeSession, Vec<u8>)>,
    /// Number of nodes queried
    pub queried: usize,
}

/// Iterative get_peers towards `info_hash`
pub async fn lookup_peers(dht: &Arc<DHT>, info_hash: [u8; 20]) -> Result<LookupResult> {
    let target = NodeId::from(info_hash);
    let mut shortlist = dht.routing_table.read().await.find_closest(&target, K * 2);
    if shortlist.is_empty() {
        return Err(TorrentError::dht_error("Routing table is empty").into());
    }

    let mut queried = HashSet::new();
    let mut seen_peers = HashSet::new();
    let mut result = LookupResult::default();

    for round in 0..MAX_ROUNDS {
        let batch = next_batch(&shortlist, &mut queried);
        if batch.is_empty() {
            break;
        }
        trace!("get_peers round {} querying {} nodes", round, batch.len());

        let mut set = JoinSet::new();
        for node in batch {
            let dht = Arc::clone(dht);
            set.spawn(async move {
                let result = dht.get_peers(&node, info_hash).await;
                (node, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((node, reply)) = joined else { continue };
            result.queried += 1;
            match reply {
                Ok(reply) => {
                    for peer in reply.peers {
                        if seen_peers.insert(peer) {
                            result.peers.push(peer);
                        }
                    }
                    if let Some(token) = reply.token {
                        result.tokens.push((node, token));
                    }
                    merge_candidates(&mut shortlist, &reply.nodes, &target);
                }
                Err(e) => trace!("get_peers via {} failed: {}", node.addr, e),
            }
        }
    }

    result
        .tokens
        .sort_by(|(a, _), (b, _)| a.distance_to(&target).cmp(&b.distance_to(&target)));
    debug!(
        "Lookup for {} queried {} nodes, found {} peers",
        hex::encode(info_hash),
        result.queried,
        result.peers.len()
    );
    Ok(result)
}

/// Announce to the closest nodes that gave us a token
///
/// Returns the number of nodes that accepted the announce.
pub async fn announce(dht: &Arc<DHT>, info_hash: [u8; 20], port: u16, tokens: &[(NodeSession, Vec<u8>)]) -> usize {
    let mut set = JoinSet::new();
    for (node, token) in tokens.iter().take(K) {
        let dht = Arc::clone(dht);
        let node = node.clone();
        let token = token.clone();
        set.spawn(async move { dht.announce_peer(&node, info_hash, port, &token).await });
    }

    let mut accepted = 0;
    while let Some(joined) = set.join_next().await {
        if let Ok(Ok(())) = joined {
            accepted += 1;
        }
    }
    debug!("Announced {} to {} nodes", hex::encode(info_hash), accepted);
    accepted
}

/// Look up peers for a torrent and announce ourselves on `port`
pub async fn discover_peers(dht: &Arc<DHT>, info_hash: [u8; 20], port: Option<u16>) -> Result<Vec<SocketAddr>> {
    info!("Discovering peers for {} via DHT", hex::encode(info_hash));
    let result = lookup_peers(dht, info_hash).await?;
    if let Some(port) = port {
        announce(dht, info_hash, port, &result.tokens).await;
    }
    info!("DHT found {} peers", result.peers.len());
    Ok(result.peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerManager, PeerSource};
    use crate::torrent::TorrentManager;
    use std::time::Duration;

    async fn node(torrents: Arc<TorrentManager>, peers: Arc<PeerManager>) -> Arc<DHT> {
        let mut dht = DHT::new("127.0.0.1:0".parse().unwrap(), peers, torrents).await.unwrap();
        dht.set_request_timeout(Duration::from_millis(300));
        let dht = Arc::new(dht);
        dht.start().unwrap();
        dht
    }

    #[test]
    fn test_bootstrap_config_new() {
        let config = BootstrapConfig::new(vec!["127.0.0.1:6881".to_string()]);
        assert_eq!(config.bootstrap_nodes.len(), 1);
        assert_eq!(BootstrapConfig::with_defaults().bootstrap_nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_skips_bad_hosts() {
        let config = BootstrapConfig::new(vec!["127.0.0.1:6881".to_string(), "not a host".to_string()]);
        let resolved = config.resolve().await;
        assert_eq!(resolved, vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_bootstrap_through_local_router() {
        let router = node(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;
        let joiner = node(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;

        let config = BootstrapConfig::new(vec![router.local_addr.to_string()]);
        let count = bootstrap(&joiner, &config).await.unwrap();
        assert!(count >= 1);
        router.stop();
        joiner.stop();
    }

    #[tokio::test]
    async fn test_bootstrap_fails_without_routers() {
        let joiner = node(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;
        let config = BootstrapConfig::new(Vec::new());
        assert!(bootstrap(&joiner, &config).await.is_err());
        joiner.stop();
    }

    #[tokio::test]
    async fn test_lookup_finds_serving_peer_and_announces() {
        let info_hash = [0x42u8; 20];
        let serving_torrents = Arc::new(TorrentManager::new());
        serving_torrents.register_magnet(info_hash, "test").await;
        let serving_peers = Arc::new(PeerManager::default());
        let known: SocketAddr = "10.0.0.5:51413".parse().unwrap();
        serving_peers.new_peer_session(info_hash, known, PeerSource::Tracker).await;

        let server = node(Arc::clone(&serving_torrents), Arc::clone(&serving_peers)).await;
        let client = node(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;
        client.ping(server.local_addr).await.unwrap();

        let result = lookup_peers(&client, info_hash).await.unwrap();
        assert_eq!(result.peers, vec![known]);
        assert_eq!(result.tokens.len(), 1);

        assert_eq!(announce(&client, info_hash, 6881, &result.tokens).await, 1);
        let announced: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(serving_peers.find(&info_hash, &announced).await.is_some());

        server.stop();
        client.stop();
    }

    #[tokio::test]
    async fn test_lookup_with_empty_table_fails() {
        let lonely = node(Arc::new(TorrentManager::new()), Arc::new(PeerManager::default())).await;
        assert!(lookup_peers(&lonely, [1u8; 20]).await.is_err());
        lonely.stop();
    }
}
