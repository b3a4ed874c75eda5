//! DHT message module
//!
//! KRPC envelopes carried in single UDP datagrams:
//! `{t, y:"q", q, a}` queries, `{t, y:"r", r}` responses and
//! `{t, y:"e", e:[code, message]}` errors.

use anyhow::Result;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::bencode::{self, BencodeDict, BencodeValue};
use crate::dht::node::NodeId;
use crate::error::TorrentError;

/// Generic error
pub const ERROR_GENERIC: i64 = 201;
/// Server error
pub const ERROR_SERVER: i64 = 202;
/// Protocol error, such as a malformed packet or a bad token
pub const ERROR_PROTOCOL: i64 = 203;
/// Method unknown
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// Length of one packed node: id, IPv4 address, port
pub const COMPACT_NODE_LEN: usize = 26;
/// Length of one packed peer: IPv4 address, port
pub const COMPACT_PEER_LEN: usize = 6;

/// Query methods understood by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Ping => "ping",
            QueryType::FindNode => "find_node",
            QueryType::GetPeers => "get_peers",
            QueryType::AnnouncePeer => "announce_peer",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(QueryType::Ping),
            b"find_node" => Some(QueryType::FindNode),
            b"get_peers" => Some(QueryType::GetPeers),
            b"announce_peer" => Some(QueryType::AnnouncePeer),
            _ => None,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded KRPC message
#[derive(Debug, Clone, PartialEq)]
pub enum DhtMessage {
    Query {
        transaction_id: Vec<u8>,
        /// Raw method name; unknown methods are answered with error 204
        method: Vec<u8>,
        args: BencodeDict,
    },
    Response {
        transaction_id: Vec<u8>,
        values: BencodeDict,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

impl DhtMessage {
    /// Transaction id of any message kind
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            DhtMessage::Query { transaction_id, .. }
            | DhtMessage::Response { transaction_id, .. }
            | DhtMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    /// Replace the transaction id, used when a request is registered
    pub fn set_transaction_id(&mut self, id: Vec<u8>) {
        match self {
            DhtMessage::Query { transaction_id, .. }
            | DhtMessage::Response { transaction_id, .. }
            | DhtMessage::Error { transaction_id, .. } => *transaction_id = id,
        }
    }

    /// Query method, if this is a known query
    pub fn query_type(&self) -> Option<QueryType> {
        match self {
            DhtMessage::Query { method, .. } => QueryType::from_name(method),
            _ => None,
        }
    }

    /// The sender's node id (`a.id` for queries, `r.id` for responses)
    pub fn sender_id(&self) -> Option<NodeId> {
        let dict = match self {
            DhtMessage::Query { args, .. } => args,
            DhtMessage::Response { values, .. } => values,
            DhtMessage::Error { .. } => return None,
        };
        dict.get_bytes("id").and_then(NodeId::from_slice)
    }

    fn query(query_type: QueryType, our_id: NodeId, extra: BencodeDict) -> Self {
        let mut args = BencodeDict::new().with("id", &our_id.0[..]);
        for (key, value) in extra.iter() {
            args.insert(key, value.clone());
        }
        DhtMessage::Query {
            transaction_id: Vec::new(),
            method: query_type.as_str().as_bytes().to_vec(),
            args,
        }
    }

    /// Create a ping query
    pub fn ping(our_id: NodeId) -> Self {
        Self::query(QueryType::Ping, our_id, BencodeDict::new())
    }

    /// Create a find_node query
    pub fn find_node(our_id: NodeId, target: NodeId) -> Self {
        Self::query(QueryType::FindNode, our_id, BencodeDict::new().with("target", &target.0[..]))
    }

    /// Create a get_peers query
    pub fn get_peers(our_id: NodeId, info_hash: [u8; 20]) -> Self {
        Self::query(QueryType::GetPeers, our_id, BencodeDict::new().with("info_hash", &info_hash[..]))
    }

    /// Create an announce_peer query echoing the token from get_peers
    pub fn announce_peer(our_id: NodeId, info_hash: [u8; 20], port: u16, token: &[u8], implied_port: bool) -> Self {
        let extra = BencodeDict::new()
            .with("implied_port", if implied_port { 1i64 } else { 0i64 })
            .with("info_hash", &info_hash[..])
            .with("port", port)
            .with("token", token);
        Self::query(QueryType::AnnouncePeer, our_id, extra)
    }

    /// Create a response carrying our id plus the given values
    pub fn response(transaction_id: &[u8], our_id: NodeId, extra: BencodeDict) -> Self {
        let mut values = BencodeDict::new().with("id", &our_id.0[..]);
        for (key, value) in extra.iter() {
            values.insert(key, value.clone());
        }
        DhtMessage::Response {
            transaction_id: transaction_id.to_vec(),
            values,
        }
    }

    /// Create an error reply
    pub fn error(transaction_id: &[u8], code: i64, message: impl Into<String>) -> Self {
        DhtMessage::Error {
            transaction_id: transaction_id.to_vec(),
            code,
            message: message.into(),
        }
    }

    /// Encode to a datagram
    pub fn encode(&self) -> Vec<u8> {
        let dict = match self {
            DhtMessage::Query { transaction_id, method, args } => BencodeDict::new()
                .with("t", transaction_id.as_slice())
                .with("y", "q")
                .with("q", method.as_slice())
                .with("a", args.clone()),
            DhtMessage::Response { transaction_id, values } => BencodeDict::new()
                .with("t", transaction_id.as_slice())
                .with("y", "r")
                .with("r", values.clone()),
            DhtMessage::Error { transaction_id, code, message } => BencodeDict::new()
                .with("t", transaction_id.as_slice())
                .with("y", "e")
                .with(
                    "e",
                    vec![BencodeValue::Integer(*code), BencodeValue::from(message.as_str())],
                ),
        };
        bencode::encode(&BencodeValue::Dict(dict))
    }

    /// Decode a datagram
    pub fn decode(data: &[u8]) -> Result<Self> {
        let dict = bencode::decode(data)?
            .into_dict()
            .ok_or_else(|| TorrentError::malformed("DHT message is not a dictionary"))?;

        let transaction_id = dict
            .get_bytes("t")
            .ok_or_else(|| TorrentError::malformed("DHT message without transaction id"))?
            .to_vec();

        match dict.get_bytes("y") {
            Some(b"q") => {
                let method = dict
                    .get_bytes("q")
                    .ok_or_else(|| TorrentError::malformed("DHT query without method"))?
                    .to_vec();
                let args = dict
                    .get_dict("a")
                    .cloned()
                    .ok_or_else(|| TorrentError::malformed("DHT query without arguments"))?;
                Ok(DhtMessage::Query { transaction_id, method, args })
            }
            Some(b"r") => {
                let values = dict
                    .get_dict("r")
                    .cloned()
                    .ok_or_else(|| TorrentError::malformed("DHT response without values"))?;
                Ok(DhtMessage::Response { transaction_id, values })
            }
            Some(b"e") => {
                let list = dict.get_list("e").unwrap_or(&[]);
                let code = list.first().and_then(BencodeValue::as_integer).unwrap_or(ERROR_GENERIC);
                let message = list
                    .get(1)
                    .and_then(BencodeValue::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .unwrap_or_default();
                Ok(DhtMessage::Error { transaction_id, code, message })
            }
            _ => Err(TorrentError::malformed("DHT message with unknown type").into()),
        }
    }
}

/// Parse nodes from compact node format (26 bytes per node: 20 bytes ID + 4 bytes IP + 2 bytes port)
pub fn parse_compact_nodes(data: &[u8]) -> Result<Vec<(NodeId, SocketAddr)>> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(TorrentError::malformed(format!("Invalid compact nodes data length {}", data.len())).into());
    }

    Ok(data
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[0..20])?;
            Some((id, parse_compact_addr(&chunk[20..26])))
        })
        .collect())
}

/// Serialize nodes to compact format; IPv6 nodes are skipped
pub fn serialize_compact_nodes<'a>(nodes: impl IntoIterator<Item = (&'a NodeId, &'a SocketAddr)>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for (node_id, addr) in nodes {
        if let SocketAddr::V4(v4) = addr {
            buffer.extend_from_slice(node_id.as_bytes());
            buffer.extend_from_slice(&v4.ip().octets());
            buffer.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    buffer
}

/// Parse peers from compact peer format (6 bytes per peer: 4 bytes IP + 2 bytes port)
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::malformed(format!("Invalid compact peers data length {}", data.len())).into());
    }
    Ok(data.chunks_exact(COMPACT_PEER_LEN).map(parse_compact_addr).collect())
}

/// Serialize peers to compact format; IPv6 peers are skipped
pub fn serialize_compact_peers<'a>(peers: impl IntoIterator<Item = &'a SocketAddr>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for addr in peers {
        if let Some(packed) = compact_addr(addr) {
            buffer.extend_from_slice(&packed);
        }
    }
    buffer
}

/// Pack a single IPv4 address
pub fn compact_addr(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut packed = [0u8; COMPACT_PEER_LEN];
            packed[..4].copy_from_slice(&v4.ip().octets());
            packed[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(packed)
        }
        SocketAddr::V6(_) => None,
    }
}

fn parse_compact_addr(chunk: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// Peers of a get_peers `values` list: one packed peer per byte string
pub fn parse_peer_values(values: &[BencodeValue]) -> Vec<SocketAddr> {
    values
        .iter()
        .filter_map(BencodeValue::as_bytes)
        .filter(|b| b.len() == COMPACT_PEER_LEN)
        .map(parse_compact_addr)
        .collect()
}

/// Build a get_peers `values` list
pub fn peer_values<'a>(peers: impl IntoIterator<Item = &'a SocketAddr>) -> Vec<BencodeValue> {
    peers
        .into_iter()
        .filter_map(compact_addr)
        .map(|packed| BencodeValue::Bytes(packed.to_vec()))
        .collect()
}
