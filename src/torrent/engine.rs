//! Swarm engine
//!
//! Owns every service of a running node and the background loops around
//! them: the inbound listener, periodic peer exchange and slot
//! optimisation, outbound dialing and one discovery loop per torrent.
//! A torrent whose discovery channels are all exhausted is marked failed
//! and retried with exponential backoff.

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::cli::Config;
use crate::dht::{bootstrap, discover_peers, BootstrapConfig, DHT};
use crate::error::{kind_of, TorrentError};
use crate::peer::connection::log_outcome;
use crate::peer::{self, Bandwidth, LocalDiscovery, PeerCommand, PeerContext, PeerManager, PeerSource, PeerState};
use crate::protocol::pex::PEX_INTERVAL;
use crate::protocol::{upload_only, ExtensionType, Handshake, LocalCapabilities};
use crate::torrent::magnet::MagnetInfo;
use crate::torrent::manager::TorrentManager;
use crate::torrent::session::{PieceCompletion, SessionStats, TorrentSession};
use crate::torrent::TorrentInfo;
use crate::tracker::TrackerManager;

/// Period of outbound dialing
pub const CONNECT_INTERVAL: Duration = Duration::from_secs(10);
/// Period of the upload slot optimisation pass
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(60);
/// Period of a healthy discovery loop
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);
/// First retry delay after every discovery channel failed
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);
/// How long leaving a torrent waits for its current discovery round
pub const DISCOVERY_STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Dials started per torrent per tick
const CONNECT_BATCH: usize = 8;

/// Doubling retry delay
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { current: INITIAL_BACKOFF }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

/// One torrent in the status report
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    #[serde(flatten)]
    pub stats: SessionStats,
    pub peers: usize,
    pub connections: usize,
    pub trackers_active: usize,
}

/// Serializable view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub listen_port: u16,
    pub dht_nodes: Option<usize>,
    pub torrents: Vec<TorrentStatus>,
}

/// A torrent's discovery loop and the flag that stops it between rounds
struct DiscoveryTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DiscoveryTask {
    fn spawn(engine: Weak<SwarmEngine>, session: Arc<TorrentSession>) -> Self {
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(discovery_loop(engine, session, stopped));
        Self { stop, handle }
    }

    /// Let the current round (and its announces) finish, then end the loop
    async fn stop(self, info_hash: &[u8; 20]) {
        let _ = self.stop.send(true);
        let mut handle = self.handle;
        match timeout(DISCOVERY_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => trace!("Discovery of {} stopped", hex::encode(info_hash)),
            Ok(Err(e)) => warn!("Discovery task of {} failed: {}", hex::encode(info_hash), e),
            Err(_) => {
                warn!(
                    "Discovery round of {} still running after {:?}, aborting it",
                    hex::encode(info_hash),
                    DISCOVERY_STOP_TIMEOUT
                );
                handle.abort();
            }
        }
    }
}

pub struct SwarmEngine {
    config: Config,
    peer_id: [u8; 20],
    listen_addr: SocketAddr,
    peers: Arc<PeerManager>,
    torrents: Arc<TorrentManager>,
    trackers: Arc<TrackerManager>,
    dht: Option<Arc<DHT>>,
    lsd: Option<Arc<LocalDiscovery>>,
    ctx: Arc<PeerContext>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    discovery: Mutex<HashMap<[u8; 20], DiscoveryTask>>,
    /// Torrents whose completion was already announced
    completed: Mutex<HashSet<[u8; 20]>>,
}

impl SwarmEngine {
    /// Bind the sockets, build the services and start the background loops
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        let peer_id = Handshake::generate_peer_id();
        info!("Starting swarm engine, peer id {}", String::from_utf8_lossy(&peer_id[..8]));

        let listener = TcpListener::bind(config.get_listen_addr()).await.map_err(|e| {
            error!("Failed to bind TCP listener to {}: {}", config.get_listen_addr(), e);
            TorrentError::network_error_full("Failed to bind peer listener", config.get_listen_addr(), e.to_string())
        })?;
        let listen_addr = listener.local_addr()?;
        info!("Listening for peers on {}", listen_addr);

        let peers = Arc::new(PeerManager::new(config.max_upload_slots));
        let torrents = Arc::new(TorrentManager::new());

        let dht = if config.use_dht {
            let dht = Arc::new(DHT::new(config.get_dht_addr().parse()?, Arc::clone(&peers), Arc::clone(&torrents)).await?);
            Some(dht)
        } else {
            None
        };

        let lsd = if config.use_lsd {
            match LocalDiscovery::bind(listen_addr.port(), Arc::clone(&peers), Arc::clone(&torrents)).await {
                Ok(lsd) => Some(lsd),
                Err(e) => {
                    warn!("Local service discovery unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let trackers = Arc::new(TrackerManager::new(Arc::clone(&peers), peer_id, listen_addr.port(), config.tracker_size));
        if config.use_tracker {
            let added = trackers.register_all(&config.trackers).await;
            debug!("Tracker pool seeded with {} announce URLs", added);
        }

        let mut ctx = PeerContext::new(peer_id, listen_addr.port(), Arc::clone(&peers), Arc::clone(&torrents));
        ctx.capabilities = Arc::new(LocalCapabilities::new(dht.is_some(), true, false));
        ctx.encryption = config.encryption;
        ctx.bandwidth = Bandwidth::new(config.upload_limit, config.download_limit);
        ctx.dht = dht.clone();
        let ctx = Arc::new(ctx);

        let engine = Arc::new(Self {
            config,
            peer_id,
            listen_addr,
            peers,
            torrents,
            trackers,
            dht,
            lsd,
            ctx,
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            discovery: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashSet::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(listener, Arc::clone(&engine.ctx))));
        tasks.push(tokio::spawn(maintenance_loop(Arc::downgrade(&engine))));
        if let Some(period) = engine.config.status_interval {
            tasks.push(tokio::spawn(status_loop(Arc::downgrade(&engine), period)));
        }
        if let Some(dht) = &engine.dht {
            tasks.push(dht.start()?);
            let nodes = if engine.config.bootstrap_nodes.is_empty() {
                BootstrapConfig::with_defaults()
            } else {
                BootstrapConfig::new(engine.config.bootstrap_nodes.clone())
            };
            let dht = Arc::clone(dht);
            tasks.push(tokio::spawn(async move {
                match bootstrap(&dht, &nodes).await {
                    Ok(count) => info!("DHT bootstrapped with {} nodes", count),
                    Err(e) => warn!("DHT bootstrap failed: {}", e),
                }
            }));
        }
        if let Some(lsd) = &engine.lsd {
            tasks.push(lsd.start());
        }
        engine.with_tasks(|t| t.extend(tasks));
        Ok(engine)
    }

    fn with_tasks<T>(&self, f: impl FnOnce(&mut Vec<JoinHandle<()>>) -> T) -> T {
        match self.tasks.lock() {
            Ok(mut tasks) => f(&mut tasks),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn torrents(&self) -> &Arc<TorrentManager> {
        &self.torrents
    }

    pub fn trackers(&self) -> &Arc<TrackerManager> {
        &self.trackers
    }

    pub fn dht(&self) -> Option<&Arc<DHT>> {
        self.dht.as_ref()
    }

    pub fn context(&self) -> &Arc<PeerContext> {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Join a torrent whose metainfo is known
    pub async fn add_torrent(self: &Arc<Self>, info: TorrentInfo, completion: Arc<dyn PieceCompletion>) -> Arc<TorrentSession> {
        let session = self.torrents.register(info, completion).await;
        self.start(&session);
        session
    }

    /// Join a torrent from a magnet link; metadata arrives over ut_metadata
    pub async fn add_magnet(self: &Arc<Self>, magnet: &MagnetInfo) -> Arc<TorrentSession> {
        let session = self.torrents.register_magnet(magnet.info_hash, magnet.name()).await;
        session.add_trackers(&magnet.trackers);
        for addr in &magnet.peers {
            self.peers.new_peer_session(magnet.info_hash, *addr, PeerSource::Connect).await;
        }
        self.start(&session);
        session
    }

    /// Spawn the discovery loop of `session` unless one is running
    fn start(self: &Arc<Self>, session: &Arc<TorrentSession>) {
        if !self.is_running() {
            return;
        }
        let info_hash = session.info_hash();
        let Ok(mut discovery) = self.discovery.lock() else {
            return;
        };
        if discovery.get(&info_hash).is_some_and(|task| !task.handle.is_finished()) {
            return;
        }
        discovery.insert(info_hash, DiscoveryTask::spawn(Arc::downgrade(self), Arc::clone(session)));
    }

    /// One discovery round over every enabled channel.
    ///
    /// Returns the number of peer addresses learned. Fails with
    /// `DownloadFailure` when no channel is enabled or all of them failed.
    pub async fn discover(&self, session: &Arc<TorrentSession>) -> Result<usize> {
        let info_hash = session.info_hash();
        let mut channels = 0;
        let mut failures = Vec::new();
        let mut found = 0;

        if let Some(dht) = self.dht.as_ref().filter(|_| !session.is_private()) {
            channels += 1;
            match discover_peers(dht, info_hash, Some(self.listen_addr.port())).await {
                Ok(addrs) => {
                    for addr in &addrs {
                        self.peers.new_peer_session(info_hash, *addr, PeerSource::Dht).await;
                    }
                    found += addrs.len();
                }
                Err(e) => failures.push(format!("dht: {}", e)),
            }
        }

        if let Some(lsd) = self.lsd.as_ref().filter(|_| !session.is_private()) {
            channels += 1;
            if let Err(e) = lsd.announce(&info_hash).await {
                failures.push(format!("lsd: {}", e));
            }
        }

        if self.config.use_tracker {
            channels += 1;
            match self.trackers.find_peers(session).await {
                Ok(n) => found += n,
                Err(e) => failures.push(format!("trackers: {}", e)),
            }
        }

        if channels == 0 {
            return Err(TorrentError::download_failure_for("No discovery channel enabled", hex::encode(info_hash)).into());
        }
        if failures.len() == channels {
            return Err(TorrentError::download_failure_for(failures.join("; "), hex::encode(info_hash)).into());
        }
        debug!("Discovery for {} found {} peers", session.name(), found);
        Ok(found)
    }

    /// Dial picked peers until the torrent's connection budget is used
    pub async fn connect_peers(&self, session: &Arc<TorrentSession>) -> usize {
        if !self.is_running() {
            return 0;
        }
        let info_hash = session.info_hash();
        let busy = self
            .peers
            .sessions(&info_hash)
            .await
            .iter()
            .filter(|p| p.state() != PeerState::Disconnected)
            .count();
        let budget = self.config.max_peers.saturating_sub(busy).min(CONNECT_BATCH);

        let mut dialed = 0;
        while dialed < budget {
            let Some(peer) = self.peers.pick(&info_hash).await else {
                break;
            };
            if peer.addr() == self.listen_addr {
                continue;
            }
            let ctx = Arc::clone(&self.ctx);
            let torrent = Arc::clone(session);
            let peers = Arc::clone(&self.peers);
            tokio::spawn(async move {
                let addr = peer.addr();
                log_outcome(addr, peer::connect(ctx, torrent, Arc::clone(&peer)).await);
                if peer.available() {
                    peers.inferior(&peer).await;
                }
            });
            dialed += 1;
        }
        if dialed > 0 {
            trace!("Dialing {} peers for {}", dialed, session.name());
        }
        dialed
    }

    /// Record a verified piece: tell partners, and on completion tell the
    /// trackers and every peer that we now only upload
    pub async fn piece_completed(&self, info_hash: &[u8; 20], index: u32) -> Result<bool> {
        let session = self
            .torrents
            .get(info_hash)
            .await
            .ok_or_else(|| TorrentError::download_failure_for("Torrent is not registered", hex::encode(info_hash)))?;
        session.completion().on_piece_completed(index);
        let told = self.peers.have(info_hash, index).await;
        trace!("Piece {} of {} announced to {} peers", index, session.name(), told);

        if !session.is_complete() || !self.mark_completed(info_hash) {
            return Ok(false);
        }
        info!("Torrent {} is complete", session.name());
        let notified = self.trackers.complete(info_hash).await;
        let payload = upload_only::encode(true);
        let told = self
            .peers
            .broadcast(info_hash, PeerCommand::Extension { ext: ExtensionType::UploadOnly, payload })
            .await;
        debug!("Completion sent to {} trackers and {} peers", notified, told);
        Ok(true)
    }

    fn mark_completed(&self, info_hash: &[u8; 20]) -> bool {
        self.completed.lock().map(|mut done| done.insert(*info_hash)).unwrap_or(false)
    }

    /// Leave a torrent: stop discovery once its current round is done,
    /// send the final tracker announce and close its connections
    pub async fn remove_torrent(&self, info_hash: &[u8; 20]) -> Option<Arc<TorrentSession>> {
        let task = self.discovery.lock().ok().and_then(|mut d| d.remove(info_hash));
        if let Some(task) = task {
            task.stop(info_hash).await;
        }
        self.trackers.release(info_hash).await;
        self.peers.remove_torrent(info_hash).await;
        if let Ok(mut done) = self.completed.lock() {
            done.remove(info_hash);
        }
        self.torrents.remove(info_hash).await
    }

    pub async fn status(&self) -> EngineStatus {
        let mut torrents = Vec::new();
        for session in self.torrents.sessions().await {
            let info_hash = session.info_hash();
            torrents.push(TorrentStatus {
                stats: session.stats(),
                peers: self.peers.peer_count(&info_hash).await,
                connections: self.peers.connection_count(&info_hash).await,
                trackers_active: self.trackers.launchers(&info_hash).await.iter().filter(|l| l.available()).count(),
            });
        }
        let dht_nodes = match &self.dht {
            Some(dht) => Some(dht.node_count().await),
            None => None,
        };
        EngineStatus { listen_port: self.listen_addr.port(), dht_nodes, torrents }
    }

    /// Status as pretty-printed JSON
    pub async fn status_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.status().await)?)
    }

    /// Stop every loop, release the trackers and close all connections
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down swarm engine");
        let discovery: Vec<([u8; 20], DiscoveryTask)> =
            self.discovery.lock().map(|mut d| d.drain().collect()).unwrap_or_default();
        for (info_hash, task) in discovery {
            task.stop(&info_hash).await;
        }
        self.trackers.shutdown().await;
        for info_hash in self.torrents.info_hashes().await {
            self.peers.remove_torrent(&info_hash).await;
        }
        if let Some(dht) = &self.dht {
            dht.stop();
        }
        if let Some(lsd) = &self.lsd {
            lsd.stop();
        }
        for task in self.with_tasks(std::mem::take) {
            task.abort();
        }
        info!("Swarm engine stopped");
    }
}

impl std::fmt::Debug for SwarmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmEngine")
            .field("listen_addr", &self.listen_addr)
            .field("dht", &self.dht.is_some())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<PeerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Inbound connection from {}", addr);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { log_outcome(addr, peer::accept(ctx, stream, addr).await) });
            }
            Err(e) => {
                warn!("Failed to accept peer connection: {}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn maintenance_loop(engine: Weak<SwarmEngine>) {
    let mut connect = interval(CONNECT_INTERVAL);
    let mut exchange = interval(PEX_INTERVAL);
    let mut optimize = interval(OPTIMIZE_INTERVAL);
    for timer in [&mut connect, &mut exchange, &mut optimize] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            _ = connect.tick() => {
                let Some(engine) = engine.upgrade() else { break };
                for session in engine.torrents.sessions().await {
                    engine.connect_peers(&session).await;
                }
            }
            _ = exchange.tick() => {
                let Some(engine) = engine.upgrade() else { break };
                for info_hash in engine.torrents.info_hashes().await {
                    engine.peers.exchange(&info_hash).await;
                }
            }
            _ = optimize.tick() => {
                let Some(engine) = engine.upgrade() else { break };
                for info_hash in engine.torrents.info_hashes().await {
                    let report = engine.peers.optimize(&info_hash).await;
                    if !report.evicted.is_empty() {
                        debug!("Evicted {} peers of {}", report.evicted.len(), hex::encode(info_hash));
                    }
                }
            }
        }
    }
}

async fn discovery_loop(engine: Weak<SwarmEngine>, session: Arc<TorrentSession>, mut stop: watch::Receiver<bool>) {
    let mut backoff = Backoff::new();
    while !*stop.borrow() {
        let Some(engine) = engine.upgrade() else { break };
        if !engine.is_running() {
            break;
        }
        let wait = match engine.discover(&session).await {
            Ok(_) => {
                if session.failure().is_some() {
                    info!("Discovery for {} recovered", session.name());
                }
                session.set_failure(None);
                backoff.reset();
                DISCOVERY_INTERVAL
            }
            Err(e) if matches!(kind_of(&e), Some(TorrentError::DownloadFailure { .. })) => {
                let delay = backoff.next();
                warn!("Discovery for {} exhausted, retrying in {:?}: {}", session.name(), delay, e);
                session.set_failure(Some(e.to_string()));
                delay
            }
            Err(e) => {
                warn!("Discovery for {} failed: {}", session.name(), e);
                DISCOVERY_INTERVAL
            }
        };
        if *stop.borrow() {
            break;
        }
        engine.connect_peers(&session).await;
        drop(engine);
        tokio::select! {
            _ = sleep(wait) => {}
            _ = stop.changed() => break,
        }
    }
    debug!("Discovery loop of {} finished", session.name());
}

async fn status_loop(engine: Weak<SwarmEngine>, period: Duration) {
    let mut timer = interval(period);
    timer.tick().await;
    loop {
        timer.tick().await;
        let Some(engine) = engine.upgrade() else { break };
        for torrent in engine.status().await.torrents {
            let stats = &torrent.stats;
            info!(
                "{}: {} peers ({} connected), up {} B, down {} B, left {} B{}",
                stats.name,
                torrent.peers,
                torrent.connections,
                stats.uploaded,
                stats.downloaded,
                stats.left,
                stats.failure.as_deref().map(|f| format!(", failing: {}", f)).unwrap_or_default()
            );
        }
    }
}
