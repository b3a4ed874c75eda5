//! Peer connection module
//!
//! Drives one peer-wire connection from dial (or accept) to close. The
//! stream is optionally wrapped by MSE before the handshake; afterwards a
//! writer task drains an outbound queue while the connection loop reads
//! frames, runs registry commands and keeps the link alive.

use crate::dht::DHT;
use crate::error::{kind_of, TorrentError};
use crate::peer::limiter::Bandwidth;
use crate::peer::manager::{ConnectionHandle, PeerCommand, PeerManager};
use crate::peer::state::{PeerSession, PeerSource, PeerState};
use crate::protocol::extension::{
    ExtensionContext, ExtensionDispatcher, ExtensionHandshake, ExtensionSender, ExtensionType, HANDSHAKE_ID,
};
use crate::protocol::handshake::CLIENT_NAME;
use crate::protocol::{
    metadata, mse, write_handshake, write_message, CryptoStream, EncryptionMode, FrameDecoder, GuardVerdict,
    Handshake, HandshakeGuard, LocalCapabilities, Message, PexState, Reserved,
};
use crate::torrent::{TorrentManager, TorrentSession};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the handshake liveness check
pub const HANDSHAKE_CHECK: Duration = Duration::from_secs(10);

/// Keep-alive send interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A peer silent for this long is dropped
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest block we serve
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Services shared by every connection
pub struct PeerContext {
    pub peer_id: [u8; 20],
    pub listen_port: u16,
    pub capabilities: Arc<LocalCapabilities>,
    pub encryption: EncryptionMode,
    pub peers: Arc<PeerManager>,
    pub torrents: Arc<TorrentManager>,
    pub bandwidth: Bandwidth,
    pub dispatcher: Arc<ExtensionDispatcher>,
    pub dht: Option<Arc<DHT>>,
    pub handshake_check: Duration,
}

impl PeerContext {
    pub fn new(peer_id: [u8; 20], listen_port: u16, peers: Arc<PeerManager>, torrents: Arc<TorrentManager>) -> Self {
        Self {
            peer_id,
            listen_port,
            capabilities: Arc::new(LocalCapabilities::default()),
            encryption: EncryptionMode::default(),
            peers,
            torrents,
            bandwidth: Bandwidth::default(),
            dispatcher: Arc::new(ExtensionDispatcher::with_defaults()),
            dht: None,
            handshake_check: HANDSHAKE_CHECK,
        }
    }
}

/// A handshaked connection, ready to run
pub struct PeerConnection<S> {
    ctx: Arc<PeerContext>,
    torrent: Arc<TorrentSession>,
    peer: Arc<PeerSession>,
    stream: CryptoStream<S>,
    decoder: FrameDecoder,
    remote: Handshake,
}

/// Dial `peer` and run the connection until it closes
pub async fn connect(ctx: Arc<PeerContext>, torrent: Arc<TorrentSession>, peer: Arc<PeerSession>) -> Result<()> {
    peer.set_state(PeerState::Connecting);
    peer.set_outgoing(true);
    match PeerConnection::dial(&ctx, &torrent, &peer).await {
        Ok(connection) => connection.run().await,
        Err(e) => {
            let failures = peer.fail();
            peer.set_state(PeerState::Disconnected);
            if kind_of(&e).is_some_and(TorrentError::is_fatal_for_peer) {
                peer.mark_unavailable();
            }
            debug!("Connection to {} failed ({} failures): {}", peer.addr(), failures, e);
            Err(e)
        }
    }
}

/// Handle an inbound TCP connection until it closes
pub async fn accept(ctx: Arc<PeerContext>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let connection = match PeerConnection::answer(&ctx, stream, addr).await {
        Ok(connection) => connection,
        Err(e) => {
            debug!("Rejected inbound connection from {}: {}", addr, e);
            return Err(e);
        }
    };
    connection.run().await
}

impl PeerConnection<TcpStream> {
    async fn dial(ctx: &Arc<PeerContext>, torrent: &Arc<TorrentSession>, peer: &Arc<PeerSession>) -> Result<Self> {
        let addr = peer.addr();
        let info_hash = torrent.info_hash();
        info!("Connecting to peer: {}", addr);

        let socket = Self::open(addr).await?;
        let stream = if ctx.encryption.crypt() {
            match timeout(ctx.handshake_check * 2, mse::initiate(socket, info_hash, ctx.encryption)).await {
                Ok(Ok(stream)) => stream,
                result => {
                    let e: anyhow::Error = match result {
                        Ok(Err(e)) => e,
                        _ => TorrentError::timeout_with_target("MSE handshake", addr.to_string()).into(),
                    };
                    if ctx.encryption != EncryptionMode::PreferEncrypt {
                        return Err(e);
                    }
                    debug!("MSE with {} failed ({}), retrying in plaintext", addr, e);
                    CryptoStream::plaintext(Self::open(addr).await?, Vec::new())
                }
            }
        } else {
            CryptoStream::plaintext(socket, Vec::new())
        };

        let mut connection = PeerConnection {
            ctx: Arc::clone(ctx),
            torrent: Arc::clone(torrent),
            peer: Arc::clone(peer),
            stream,
            decoder: FrameDecoder::new(),
            remote: Handshake::new(info_hash, [0u8; 20]),
        };
        connection.send_handshake().await?;
        let remote = connection.receive_handshake().await?;
        if !remote.validate(&info_hash) {
            return Err(TorrentError::protocol_violation_with_peer("Handshake info hash mismatch", addr.to_string()).into());
        }
        connection.accept_remote(remote)?;
        Ok(connection)
    }

    async fn answer(ctx: &Arc<PeerContext>, stream: TcpStream, addr: SocketAddr) -> Result<Self> {
        debug!("Inbound connection from {}", addr);
        let info_hashes = ctx.torrents.info_hashes().await;
        let accepted = timeout(ctx.handshake_check * 2, mse::accept(stream, &info_hashes, ctx.encryption))
            .await
            .map_err(|_| TorrentError::timeout_with_target("MSE handshake", addr.to_string()))??;

        let mut decoder = FrameDecoder::new();
        let mut stream = accepted.stream;
        let remote = read_handshake_guarded(&mut decoder, &mut stream, ctx.handshake_check, addr).await?;
        if accepted.info_hash.is_some_and(|ih| ih != remote.info_hash) {
            return Err(TorrentError::protocol_violation_with_peer("Handshake contradicts MSE info hash", addr.to_string()).into());
        }
        let torrent = ctx.torrents.get(&remote.info_hash).await.ok_or_else(|| {
            TorrentError::protocol_violation_with_peer(
                format!("Unknown torrent {}", hex::encode(remote.info_hash)),
                addr.to_string(),
            )
        })?;

        let peer = ctx.peers.new_peer_session(remote.info_hash, addr, PeerSource::Connect).await;
        peer.set_outgoing(false);
        let mut connection =
            PeerConnection { ctx: Arc::clone(ctx), torrent, peer, stream, decoder, remote: remote.clone() };
        connection.send_handshake().await?;
        connection.accept_remote(remote)?;
        Ok(connection)
    }

    async fn open(addr: SocketAddr) -> Result<TcpStream> {
        let socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("Connection timeout to {}", addr);
                TorrentError::timeout_with_target("connect", addr.to_string())
            })?
            .map_err(|e| TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()))?;
        debug!("Connected to peer: {}", addr);
        Ok(socket)
    }
}

/// Read a handshake, giving up after two failed liveness checks
async fn read_handshake_guarded<S>(
    decoder: &mut FrameDecoder,
    stream: &mut S,
    check_every: Duration,
    addr: SocketAddr,
) -> Result<Handshake>
where
    S: AsyncRead + Unpin,
{
    let mut guard = HandshakeGuard::new();
    let mut check = interval_at(Instant::now() + check_every, check_every);
    loop {
        tokio::select! {
            handshake = decoder.read_handshake(stream) => {
                guard.mark_handshaked();
                return handshake;
            }
            _ = check.tick() => match guard.check() {
                GuardVerdict::Useless => {
                    debug!("No handshake from {}, closing", addr);
                    return Err(TorrentError::timeout_with_target("handshake", addr.to_string()).into());
                }
                GuardVerdict::Suspect => trace!("Still waiting for a handshake from {}", addr),
                GuardVerdict::Alive => {}
            },
        }
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_handshake(&mut self) -> Result<()> {
        let handshake =
            Handshake::with_reserved(self.torrent.info_hash(), self.ctx.peer_id, self.ctx.capabilities.reserved());
        write_handshake(&mut self.stream, &handshake).await
    }

    async fn receive_handshake(&mut self) -> Result<Handshake> {
        read_handshake_guarded(&mut self.decoder, &mut self.stream, self.ctx.handshake_check, self.peer.addr()).await
    }

    fn accept_remote(&mut self, remote: Handshake) -> Result<()> {
        if remote.peer_id == self.ctx.peer_id {
            self.peer.mark_unavailable();
            return Err(TorrentError::protocol_violation_with_peer("Connected to ourselves", self.peer.addr().to_string()).into());
        }
        self.peer.set_handshake(remote.peer_id, remote.reserved);
        debug!(
            "Handshake with {} ({}) reserved {}",
            self.peer.addr(),
            crate::protocol::client_name(&remote.peer_id),
            hex::encode(remote.reserved.as_bytes())
        );
        self.remote = remote;
        Ok(())
    }

    /// Run the connection until either side closes it
    pub async fn run(self) -> Result<()> {
        let PeerConnection { ctx, torrent, peer, stream, decoder, remote } = self;
        let addr = peer.addr();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        if !ctx.peers.register_connection(ConnectionHandle::new(Arc::clone(&peer), command_tx)).await {
            debug!("Already connected to {}, dropping duplicate", addr);
            return Ok(());
        }
        peer.set_state(PeerState::Connected);
        peer.reset_failures();
        peer.set_encrypted(stream.is_encrypted());
        info!("Peer {} connected{}", addr, if stream.is_encrypted() { " (encrypted)" } else { "" });

        let (reader, writer) = tokio::io::split(stream);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(
            writer,
            message_rx,
            Arc::clone(&ctx.bandwidth.upload),
            Arc::clone(&peer),
            Arc::clone(&torrent),
        ));

        let shared = ctx.capabilities.reserved().intersect(&remote.reserved);
        let ext = ExtensionContext {
            peer: Arc::clone(&peer),
            torrent: Arc::clone(&torrent),
            peers: Arc::clone(&ctx.peers),
            sender: ExtensionSender::new(Arc::clone(&peer), message_tx.clone()),
        };
        let mut link = Link {
            ctx: Arc::clone(&ctx),
            torrent,
            peer: Arc::clone(&peer),
            tx: message_tx,
            ext,
            shared,
            pex: PexState::new(),
        };

        let result = link.run(reader, decoder, command_rx, writer_task).await;
        ctx.peers.unregister(&peer).await;
        match &result {
            Ok(()) => info!("Peer {} disconnected", addr),
            Err(e) => {
                if kind_of(e).is_some_and(TorrentError::is_fatal_for_peer) {
                    warn!("Closing {} after protocol violation: {}", addr, e);
                    peer.mark_unavailable();
                } else {
                    debug!("Peer {} disconnected: {}", addr, e);
                }
            }
        }
        result
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Message>,
    limiter: Arc<crate::peer::limiter::RateLimiter>,
    peer: Arc<PeerSession>,
    torrent: Arc<TorrentSession>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if let Some(len) = message.block_len() {
            limiter.acquire(len).await;
            peer.stats().record_upload(len as u64);
            torrent.record_upload(len as u64);
        }
        trace!("Sending {:?} to {}", message.message_id(), peer.addr());
        write_message(&mut writer, &message).await?;
    }
    Ok(())
}

/// State of a running connection
struct Link {
    ctx: Arc<PeerContext>,
    torrent: Arc<TorrentSession>,
    peer: Arc<PeerSession>,
    tx: mpsc::UnboundedSender<Message>,
    ext: ExtensionContext,
    shared: Reserved,
    pex: PexState,
}

impl Link {
    async fn run<S>(
        &mut self,
        mut reader: ReadHalf<CryptoStream<S>>,
        mut decoder: FrameDecoder,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut writer_task: JoinHandle<Result<()>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.event_loop(&mut reader, &mut decoder, &mut commands, &mut writer_task).await;
        writer_task.abort();
        result
    }

    async fn event_loop<S>(
        &mut self,
        reader: &mut ReadHalf<CryptoStream<S>>,
        decoder: &mut FrameDecoder,
        commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
        writer_task: &mut JoinHandle<Result<()>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let addr = self.peer.addr();
        let fast = self.shared.supports_fast();
        self.greet()?;

        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                message = decoder.read_message(reader, fast) => {
                    let message = message?;
                    last_seen = Instant::now();
                    let outcome = self.handle_message(message).await;
                    self.recover(outcome)?;
                }
                command = commands.recv() => match command {
                    None | Some(PeerCommand::Close) => {
                        debug!("Closing connection to {}", addr);
                        return Ok(());
                    }
                    Some(command) => {
                        let outcome = self.handle_command(command).await;
                        self.recover(outcome)?;
                    }
                },
                _ = keepalive.tick() => {
                    if last_seen.elapsed() >= IDLE_TIMEOUT {
                        return Err(TorrentError::timeout_with_target("idle peer", addr.to_string()).into());
                    }
                    self.send(Message::KeepAlive)?;
                }
                written = &mut *writer_task => {
                    return match written {
                        Ok(result) => result,
                        Err(e) => Err(TorrentError::network_error_full("Writer task failed", addr.to_string(), e.to_string()).into()),
                    };
                }
            }
        }
    }

    /// Log and swallow soft errors; anything else ends the connection
    fn recover(&self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Err(e) if kind_of(&e).is_some_and(TorrentError::is_soft) => {
                warn!("Rejected message from {}: {}", self.peer.addr(), e);
                Ok(())
            }
            other => other,
        }
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| TorrentError::network_error_with_address("Connection writer closed", self.peer.addr().to_string()).into())
    }

    /// Messages sent right after the handshake
    fn greet(&self) -> Result<()> {
        let complete = self.torrent.is_complete();

        if self.shared.supports_extensions() {
            let mut handshake = ExtensionHandshake::local(
                CLIENT_NAME,
                self.ctx.listen_port,
                self.torrent.metadata_size(),
                complete,
                Some(self.peer.addr().ip()),
            );
            if self.torrent.is_private() {
                handshake.m.retain(|(name, _)| name != ExtensionType::UtPex.name());
            }
            self.ext.sender.send_handshake(&handshake)?;
        }

        match (self.shared.supports_fast(), complete, self.local_bitfield()) {
            (true, true, _) => self.send(Message::HaveAll)?,
            (true, false, None) => self.send(Message::HaveNone)?,
            (_, _, Some(bitfield)) => self.send(Message::Bitfield { bitfield })?,
            (false, _, None) => {}
        }

        if self.shared.supports_dht() {
            if let Some(dht) = &self.ctx.dht {
                self.send(Message::Port { listen_port: dht.local_addr.port() })?;
            }
        }
        Ok(())
    }

    fn local_bitfield(&self) -> Option<Vec<u8>> {
        let completion = self.torrent.completion();
        if let Some(bitfield) = completion.bitfield() {
            return Some(bitfield);
        }
        if !completion.is_complete() {
            return None;
        }
        let count = self.torrent.info()?.piece_count();
        let mut bitfield = vec![0xFFu8; count.div_ceil(8)];
        if count % 8 != 0 {
            if let Some(last) = bitfield.last_mut() {
                *last = 0xFF << (8 - count % 8);
            }
        }
        Some(bitfield)
    }

    /// Declare interest once the peer has something we lack
    fn update_interest(&self) -> Result<()> {
        if !self.peer.am_interested() && self.torrent.has_metadata() && !self.torrent.is_complete() {
            self.peer.set_am_interested(true);
            self.send(Message::Interested)?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        let addr = self.peer.addr();
        trace!("Received {:?} from {}", message.message_id(), addr);

        match message {
            Message::KeepAlive | Message::HaveNone => {}
            Message::Choke => self.peer.set_peer_choking(true),
            Message::Unchoke => {
                self.peer.set_peer_choking(false);
                if self.peer.downloading() {
                    self.ctx.peers.preference(&self.peer).await;
                }
            }
            Message::Interested => {
                self.peer.set_peer_interested(true);
                if self.ctx.peers.admit_for_upload(&self.peer).await {
                    self.peer.set_am_choking(false);
                    self.send(Message::Unchoke)?;
                } else {
                    debug!("No upload slot for {}", addr);
                }
            }
            Message::NotInterested => {
                self.peer.set_peer_interested(false);
                if !self.peer.am_choking() {
                    self.peer.set_am_choking(true);
                    self.send(Message::Choke)?;
                }
                self.ctx.peers.release_upload(&self.peer).await;
            }
            Message::Have { .. } => self.update_interest()?,
            Message::Bitfield { bitfield } => {
                if let Some(info) = self.torrent.info() {
                    let count = info.piece_count();
                    let seed = (0..count).all(|i| bitfield.get(i / 8).is_some_and(|b| b & (0x80 >> (i % 8)) != 0));
                    self.peer.set_upload_only(seed);
                }
                self.update_interest()?;
            }
            Message::HaveAll => {
                self.peer.set_upload_only(true);
                self.update_interest()?;
            }
            Message::Request { index, begin, length } => {
                if length > MAX_REQUEST_LENGTH {
                    return Err(TorrentError::protocol_violation_with_peer(
                        format!("Request for {} bytes", length),
                        addr.to_string(),
                    )
                    .into());
                }
                if self.peer.am_choking() {
                    debug!("Ignoring request from choked peer {}", addr);
                    return Ok(());
                }
                match self.torrent.completion().read_block(index, begin, length) {
                    Some(block) => self.send(Message::Piece { index, begin, block })?,
                    None => debug!("No data for piece {} offset {} requested by {}", index, begin, addr),
                }
            }
            Message::Piece { index, begin, block } => {
                self.ctx.bandwidth.download.acquire(block.len()).await;
                self.peer.stats().record_download(block.len() as u64);
                self.torrent.record_download(block.len() as u64);
                self.torrent.completion().write_block(index, begin, &block)?;
            }
            Message::Cancel { index, begin, .. } => trace!("{} cancelled piece {} offset {}", addr, index, begin),
            Message::Port { listen_port } => {
                self.peer.set_dht_port(listen_port);
                if let (Some(dht), false) = (self.ctx.dht.clone(), self.torrent.is_private()) {
                    let node = SocketAddr::new(addr.ip(), listen_port);
                    tokio::spawn(async move {
                        if let Err(e) = dht.ping(node).await {
                            trace!("DHT node {} did not answer: {}", node, e);
                        }
                    });
                }
            }
            Message::Extended { id: HANDSHAKE_ID, payload } => self.on_extension_handshake(&payload)?,
            Message::Extended { id, payload } => self.ctx.dispatcher.dispatch(id, &payload, &self.ext).await?,
        }
        Ok(())
    }

    fn on_extension_handshake(&self, payload: &[u8]) -> Result<()> {
        let handshake = ExtensionHandshake::decode(payload)?;
        debug!(
            "Extension handshake from {} ({}): {:?}",
            self.peer.addr(),
            handshake.v.as_deref().unwrap_or("unknown client"),
            handshake.m
        );
        self.peer.set_extension_ids(handshake.m.clone());
        if let Some(port) = handshake.p {
            self.peer.set_listen_port(port);
        }
        if handshake.upload_only {
            self.peer.set_upload_only(true);
        }
        if let (Some(size), false) = (handshake.metadata_size, self.torrent.has_metadata()) {
            self.torrent.expect_metadata(size)?;
            metadata::request_next(&self.ext)?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<()> {
        match command {
            PeerCommand::Wire(message) => {
                let announces_piece = matches!(message, Message::Have { .. });
                self.send(message)?;
                if announces_piece && self.torrent.is_complete() && self.peer.am_interested() {
                    self.peer.set_am_interested(false);
                    self.send(Message::NotInterested)?;
                }
                Ok(())
            }
            PeerCommand::Extension { ext, payload } => match self.ext.sender.send(ext, payload) {
                Err(e) if matches!(kind_of(&e), Some(TorrentError::UnsupportedExtension { .. })) => {
                    trace!("{} does not support {}", self.peer.addr(), ext.name());
                    Ok(())
                }
                other => other,
            },
            PeerCommand::Exchange => self.exchange_peers().await,
            PeerCommand::Close => Ok(()),
        }
    }

    /// Send a PEX update if the peer takes them and one is due
    async fn exchange_peers(&mut self) -> Result<()> {
        if self.torrent.is_private() || !self.ext.sender.supports(ExtensionType::UtPex) || !self.pex.due() {
            return Ok(());
        }
        let candidates = self.ctx.peers.pex_candidates(&self.torrent.info_hash(), self.peer.addr().ip()).await;
        if let Some(update) = self.pex.prepare(&candidates) {
            debug!(
                "PEX to {}: {} added, {} dropped",
                self.peer.addr(),
                update.added.len(),
                update.dropped.len()
            );
            self.ext.sender.send(ExtensionType::UtPex, update.encode())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerContext")
            .field("peer_id", &hex::encode(self.peer_id))
            .field("listen_port", &self.listen_port)
            .field("encryption", &self.encryption)
            .field("dht", &self.dht.is_some())
            .finish()
    }
}

/// Log the outcome of a spawned connection task
pub(crate) fn log_outcome(addr: SocketAddr, result: Result<()>) {
    if let Err(e) = result {
        match kind_of(&e) {
            Some(kind) if kind.is_soft() => trace!("Connection with {} ended: {}", addr, e),
            Some(_) => debug!("Connection with {} ended: {}", addr, e),
            None => error!("Connection with {} failed: {}", addr, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::tests::sample_info;
    use crate::torrent::{PieceTracker, TorrentInfo};
    use tokio::net::TcpListener;

    struct Node {
        ctx: Arc<PeerContext>,
        addr: SocketAddr,
    }

    async fn node(encryption: EncryptionMode) -> (Node, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut ctx = PeerContext::new(
            Handshake::generate_peer_id(),
            addr.port(),
            Arc::new(PeerManager::default()),
            Arc::new(TorrentManager::new()),
        );
        ctx.encryption = encryption;
        ctx.handshake_check = Duration::from_millis(100);
        (Node { ctx: Arc::new(ctx), addr }, listener)
    }

    fn serve(ctx: Arc<PeerContext>, listener: TcpListener) {
        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { log_outcome(addr, accept(ctx, stream, addr).await) });
            }
        });
    }

    fn sample() -> TorrentInfo {
        TorrentInfo::from_info_bytes(&sample_info("shared.iso", 16_384 * 1_200, 16_384), Vec::new()).unwrap()
    }

    async fn fetch_metadata(seed_mode: EncryptionMode, leech_mode: EncryptionMode) -> (Arc<PeerSession>, Node) {
        let info = sample();
        let (seed, listener) = node(seed_mode).await;
        seed.ctx.torrents.register(info.clone(), Arc::new(PieceTracker::seeded(&info))).await;
        serve(Arc::clone(&seed.ctx), listener);

        let (leech, _listener) = node(leech_mode).await;
        let torrent = leech.ctx.torrents.register_magnet(info.info_hash, "magnet").await;
        let peer = leech.ctx.peers.new_peer_session(info.info_hash, seed.addr, PeerSource::Tracker).await;
        tokio::spawn(connect(Arc::clone(&leech.ctx), Arc::clone(&torrent), Arc::clone(&peer)));

        let fetched = timeout(Duration::from_secs(10), torrent.wait_for_metadata()).await.unwrap();
        assert_eq!(fetched.name, "shared.iso");
        assert_eq!(fetched.raw_info, info.raw_info);
        assert_eq!(torrent.name(), "shared.iso");
        (peer, leech)
    }

    #[tokio::test]
    async fn test_magnet_fetches_metadata_from_seed() {
        let (peer, leech) = fetch_metadata(EncryptionMode::PreferPlaintext, EncryptionMode::PreferPlaintext).await;
        assert!(peer.connected());
        assert!(!peer.is_encrypted());
        assert!(peer.is_upload_only());
        assert!(peer.extension_id("ut_metadata").is_some());
        assert_eq!(peer.client_name(), Some("swarm-engine"));
        assert!(leech.ctx.peers.is_connected(&peer.info_hash(), &peer.addr()).await);
    }

    #[tokio::test]
    async fn test_encrypted_connection() {
        let (peer, _leech) = fetch_metadata(EncryptionMode::Encrypt, EncryptionMode::Encrypt).await;
        assert!(peer.is_encrypted());
    }

    #[tokio::test]
    async fn test_unknown_torrent_is_refused() {
        let (seed, listener) = node(EncryptionMode::PreferPlaintext).await;
        serve(Arc::clone(&seed.ctx), listener);

        let (leech, _listener) = node(EncryptionMode::PreferPlaintext).await;
        let torrent = leech.ctx.torrents.register_magnet([3u8; 20], "nobody").await;
        let peer = leech.ctx.peers.new_peer_session([3u8; 20], seed.addr, PeerSource::Tracker).await;

        assert!(connect(Arc::clone(&leech.ctx), torrent, Arc::clone(&peer)).await.is_err());
        assert_eq!(peer.failures(), 1);
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert_eq!(leech.ctx.peers.connection_count(&[3u8; 20]).await, 0);
    }

    #[tokio::test]
    async fn test_silent_peer_hits_handshake_guard() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (leech, _listener) = node(EncryptionMode::Plaintext).await;
        let torrent = leech.ctx.torrents.register_magnet([4u8; 20], "silent").await;
        let peer = leech.ctx.peers.new_peer_session([4u8; 20], silent, PeerSource::Tracker).await;

        let started = Instant::now();
        let err = connect(Arc::clone(&leech.ctx), torrent, Arc::clone(&peer)).await.unwrap_err();
        assert!(matches!(kind_of(&err), Some(TorrentError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(peer.available());
    }

    #[tokio::test]
    async fn test_self_connection_marks_unavailable() {
        let info = sample();
        let (seed, listener) = node(EncryptionMode::PreferPlaintext).await;
        seed.ctx.torrents.register(info.clone(), Arc::new(PieceTracker::seeded(&info))).await;
        serve(Arc::clone(&seed.ctx), listener);

        let torrent = seed.ctx.torrents.get(&info.info_hash).await.unwrap();
        let peer = seed.ctx.peers.new_peer_session(info.info_hash, seed.addr, PeerSource::Tracker).await;
        let err = connect(Arc::clone(&seed.ctx), torrent, Arc::clone(&peer)).await.unwrap_err();
        assert!(matches!(kind_of(&err), Some(TorrentError::ProtocolViolation { .. })));
        assert!(!peer.available());
    }
}
