//! Extension protocol (LTEP)
//!
//! Extended messages carry a one-byte sub-type. Sub-type 0 is the
//! extension handshake, which tells each side the ids the other assigned
//! to the extensions it supports. Incoming sub-types are our own ids and
//! are routed through an [`ExtensionDispatcher`]; outgoing messages use the
//! peer's ids through an [`ExtensionSender`].

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bencode::{self, BencodeDict, BencodeValue};
use crate::error::TorrentError;
use crate::peer::{PeerManager, PeerSession};
use crate::protocol::message::Message;
use crate::torrent::TorrentSession;

/// Sub-type of the extension handshake
pub const HANDSHAKE_ID: u8 = 0;

/// Outstanding requests we accept
pub const DEFAULT_REQQ: i64 = 250;

/// Extensions this client implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionType {
    UtPex,
    UtMetadata,
    UploadOnly,
}

impl ExtensionType {
    /// In handshake key order
    pub const ALL: [ExtensionType; 3] = [ExtensionType::UploadOnly, ExtensionType::UtMetadata, ExtensionType::UtPex];

    /// Name used in the handshake `m` dictionary
    pub fn name(self) -> &'static str {
        match self {
            ExtensionType::UtPex => "ut_pex",
            ExtensionType::UtMetadata => "ut_metadata",
            ExtensionType::UploadOnly => "upload_only",
        }
    }

    /// Sub-type we ask peers to use when messaging us
    pub fn local_id(self) -> u8 {
        match self {
            ExtensionType::UtPex => 1,
            ExtensionType::UtMetadata => 2,
            ExtensionType::UploadOnly => 3,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

/// Extension handshake payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to sub-type; 0 disables
    pub m: Vec<(String, u8)>,
    /// Client name and version
    pub v: Option<String>,
    /// Listen port of the sender
    pub p: Option<u16>,
    pub reqq: Option<i64>,
    pub metadata_size: Option<usize>,
    pub upload_only: bool,
    /// Our address as the sender sees it
    pub yourip: Option<IpAddr>,
}

impl ExtensionHandshake {
    /// Handshake advertising every local extension
    pub fn local(
        client: &str,
        listen_port: u16,
        metadata_size: Option<usize>,
        upload_only: bool,
        yourip: Option<IpAddr>,
    ) -> Self {
        Self {
            m: ExtensionType::ALL.iter().map(|t| (t.name().to_string(), t.local_id())).collect(),
            v: Some(client.to_string()),
            p: Some(listen_port),
            reqq: Some(DEFAULT_REQQ),
            metadata_size,
            upload_only,
            yourip,
        }
    }

    /// Sub-type the sender assigned to `name`, if enabled
    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.m.iter().find(|(n, id)| n == name && *id != 0).map(|(_, id)| *id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = BencodeDict::new();
        for (name, id) in &self.m {
            m.insert(name.as_bytes(), i64::from(*id));
        }

        let mut dict = BencodeDict::new();
        dict.insert("m", m);
        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", size as i64);
        }
        if let Some(port) = self.p {
            dict.insert("p", i64::from(port));
        }
        if let Some(reqq) = self.reqq {
            dict.insert("reqq", reqq);
        }
        if self.upload_only {
            dict.insert("upload_only", 1i64);
        }
        if let Some(v) = &self.v {
            dict.insert("v", v.as_str());
        }
        if let Some(ip) = self.yourip {
            let bytes = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            dict.insert("yourip", bytes);
        }
        bencode::encode(&BencodeValue::Dict(dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TorrentError::protocol_violation("Extension handshake is not a dictionary"))?;

        let mut handshake = ExtensionHandshake::default();
        if let Some(m) = dict.get_dict("m") {
            for (name, id) in m.iter() {
                let Some(id) = id.as_integer() else { continue };
                if !(0..=255).contains(&id) {
                    continue;
                }
                handshake.m.push((String::from_utf8_lossy(name).into_owned(), id as u8));
            }
        }
        handshake.v = dict.get_str("v").map(str::to_string);
        handshake.p = dict.get_integer("p").and_then(|p| u16::try_from(p).ok()).filter(|p| *p != 0);
        handshake.reqq = dict.get_integer("reqq");
        handshake.metadata_size = dict.get_integer("metadata_size").and_then(|s| usize::try_from(s).ok());
        handshake.upload_only = dict.get_integer("upload_only").unwrap_or(0) != 0;
        handshake.yourip = dict.get_bytes("yourip").and_then(|b| match b.len() {
            4 => Some(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        });
        Ok(handshake)
    }
}

/// Pushes raw extension messages to a peer under the peer's own ids
#[derive(Debug, Clone)]
pub struct ExtensionSender {
    peer: Arc<PeerSession>,
    tx: mpsc::UnboundedSender<Message>,
}

impl ExtensionSender {
    pub fn new(peer: Arc<PeerSession>, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { peer, tx }
    }

    pub fn supports(&self, extension: ExtensionType) -> bool {
        self.peer.extension_id(extension.name()).is_some()
    }

    /// Send `payload` as `extension`; fails if the peer did not enable it
    pub fn send(&self, extension: ExtensionType, payload: Vec<u8>) -> Result<()> {
        let id = self
            .peer
            .extension_id(extension.name())
            .ok_or_else(|| TorrentError::unsupported_extension(extension.name()))?;
        self.push(Message::Extended { id, payload })
    }

    /// Send the extension handshake
    pub fn send_handshake(&self, handshake: &ExtensionHandshake) -> Result<()> {
        self.push(Message::Extended { id: HANDSHAKE_ID, payload: handshake.encode() })
    }

    fn push(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| TorrentError::network_error_with_address("Connection writer closed", self.peer.addr().to_string()).into())
    }
}

/// Everything a handler may touch while processing one message
#[derive(Clone)]
pub struct ExtensionContext {
    pub peer: Arc<PeerSession>,
    pub torrent: Arc<TorrentSession>,
    pub peers: Arc<PeerManager>,
    pub sender: ExtensionSender,
}

/// One negotiated extension
#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    fn extension(&self) -> ExtensionType;

    async fn handle(&self, payload: &[u8], ctx: &ExtensionContext) -> Result<()>;
}

/// Sub-type to handler table
#[derive(Default)]
pub struct ExtensionDispatcher {
    handlers: HashMap<u8, Box<dyn ExtensionHandler>>,
}

impl ExtensionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in extension under its local id
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Box::new(crate::protocol::pex::PexHandler));
        dispatcher.register(Box::new(crate::protocol::metadata::MetadataHandler));
        dispatcher.register(Box::new(crate::protocol::upload_only::UploadOnlyHandler));
        dispatcher
    }

    pub fn register(&mut self, handler: Box<dyn ExtensionHandler>) {
        self.handlers.insert(handler.extension().local_id(), handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route one extended message; unknown sub-types are dropped
    pub async fn dispatch(&self, id: u8, payload: &[u8], ctx: &ExtensionContext) -> Result<()> {
        match self.handlers.get(&id) {
            Some(handler) => {
                trace!("Dispatching {} ({} bytes) from {}", handler.extension().name(), payload.len(), ctx.peer.addr());
                handler.handle(payload, ctx).await
            }
            None => {
                let ignored = TorrentError::unsupported_extension(format!("sub-type {}", id));
                debug!("Ignoring message from {}: {}", ctx.peer.addr(), ignored);
                Ok(())
            }
        }
    }
}
