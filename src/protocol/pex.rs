//! ut_pex
//!
//! Periodic exchange of the peers each side is connected to.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::bencode::{self, BencodeDict, BencodeValue};
use crate::dht::message::{parse_compact_peers, serialize_compact_peers};
use crate::error::TorrentError;
use crate::peer::PeerSource;
use crate::protocol::extension::{ExtensionContext, ExtensionHandler, ExtensionType};

/// Peer prefers encrypted connections
pub const FLAG_ENCRYPTION: u8 = 0x01;
/// Peer is a seed or upload-only
pub const FLAG_SEED: u8 = 0x02;
/// Peer supports uTP
pub const FLAG_UTP: u8 = 0x04;
/// Peer supports holepunching
pub const FLAG_HOLEPUNCH: u8 = 0x08;
/// Peer accepted an outgoing connection, so it is reachable
pub const FLAG_OUTGOING: u8 = 0x10;

/// Most peers listed in either direction of one message
pub const MAX_PEX_PEERS: usize = 50;

/// Minimum time between two messages on one connection
pub const PEX_INTERVAL: Duration = Duration::from_secs(60);

const COMPACT_V6_LEN: usize = 18;

/// One ut_pex message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<(SocketAddr, u8)>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let added_v4: Vec<&(SocketAddr, u8)> = self.added.iter().filter(|(a, _)| a.is_ipv4()).collect();
        let added_v6: Vec<&(SocketAddr, u8)> = self.added.iter().filter(|(a, _)| a.is_ipv6()).collect();
        let dropped_v6: Vec<&SocketAddr> = self.dropped.iter().filter(|a| a.is_ipv6()).collect();

        let mut dict = BencodeDict::new();
        dict.insert("added", serialize_compact_peers(added_v4.iter().map(|(a, _)| a)));
        dict.insert("added.f", added_v4.iter().map(|(_, f)| *f).collect::<Vec<u8>>());
        dict.insert("added6", compact_v6(added_v6.iter().map(|(a, _)| a)));
        dict.insert("added6.f", added_v6.iter().map(|(_, f)| *f).collect::<Vec<u8>>());
        dict.insert("dropped", serialize_compact_peers(self.dropped.iter()));
        dict.insert("dropped6", compact_v6(dropped_v6.into_iter()));
        bencode::encode(&BencodeValue::Dict(dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TorrentError::malformed("ut_pex payload is not a dictionary"))?;

        let mut message = PexMessage::default();
        let mut add = |addrs: Vec<SocketAddr>, flags: Option<&[u8]>| {
            for (i, addr) in addrs.into_iter().enumerate() {
                let flag = flags.and_then(|f| f.get(i)).copied().unwrap_or(0);
                message.added.push((addr, flag));
            }
        };
        if let Some(bytes) = dict.get_bytes("added") {
            add(parse_compact_peers(bytes)?, dict.get_bytes("added.f"));
        }
        if let Some(bytes) = dict.get_bytes("added6") {
            add(parse_compact_v6(bytes)?, dict.get_bytes("added6.f"));
        }
        if let Some(bytes) = dict.get_bytes("dropped") {
            message.dropped.extend(parse_compact_peers(bytes)?);
        }
        if let Some(bytes) = dict.get_bytes("dropped6") {
            message.dropped.extend(parse_compact_v6(bytes)?);
        }
        Ok(message)
    }
}

fn compact_v6<'a>(peers: impl Iterator<Item = &'a SocketAddr>) -> Vec<u8> {
    let mut out = Vec::new();
    for addr in peers {
        if let IpAddr::V6(ip) = addr.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

fn parse_compact_v6(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % COMPACT_V6_LEN != 0 {
        return Err(TorrentError::malformed(format!("Invalid compact IPv6 peers length {}", data.len())).into());
    }
    Ok(data
        .chunks_exact(COMPACT_V6_LEN)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect())
}

/// What one connection has already told its peer
#[derive(Debug, Default)]
pub struct PexState {
    advertised: HashSet<SocketAddr>,
    last_sent: Option<Instant>,
}

impl PexState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the send interval has passed
    pub fn due(&self) -> bool {
        self.last_sent.map_or(true, |at| at.elapsed() >= PEX_INTERVAL)
    }

    /// Diff `current` against what was advertised before
    ///
    /// Returns `None` when the interval has not elapsed or nothing changed.
    pub fn prepare(&mut self, current: &[(SocketAddr, u8)]) -> Option<PexMessage> {
        if !self.due() {
            return None;
        }
        let now: HashSet<SocketAddr> = current.iter().map(|(a, _)| *a).collect();

        let added: Vec<(SocketAddr, u8)> = current
            .iter()
            .filter(|(a, _)| !self.advertised.contains(a))
            .take(MAX_PEX_PEERS)
            .copied()
            .collect();
        let dropped: Vec<SocketAddr> = self
            .advertised
            .iter()
            .filter(|a| !now.contains(a))
            .take(MAX_PEX_PEERS)
            .copied()
            .collect();

        let message = PexMessage { added, dropped };
        if message.is_empty() {
            return None;
        }
        for addr in &message.dropped {
            self.advertised.remove(addr);
        }
        self.advertised.extend(message.added.iter().map(|(a, _)| *a));
        self.last_sent = Some(Instant::now());
        Some(message)
    }
}

/// ut_pex handler: feeds received peers into the registry
pub struct PexHandler;

#[async_trait]
impl ExtensionHandler for PexHandler {
    fn extension(&self) -> ExtensionType {
        ExtensionType::UtPex
    }

    async fn handle(&self, payload: &[u8], ctx: &ExtensionContext) -> Result<()> {
        let message = PexMessage::decode(payload)?;
        let info_hash = ctx.torrent.info_hash();
        trace!(
            "PEX from {}: {} added, {} dropped",
            ctx.peer.addr(),
            message.added.len(),
            message.dropped.len()
        );

        let mut learned = 0;
        for (addr, flags) in message.added.into_iter().take(MAX_PEX_PEERS * 4) {
            if addr.port() == 0 || addr.ip().is_unspecified() {
                continue;
            }
            let session = ctx.peers.new_peer_session(info_hash, addr, PeerSource::Pex).await;
            session.set_pex_flags(flags);
            learned += 1;
        }
        if learned > 0 {
            debug!("Learned {} peers via PEX from {}", learned, ctx.peer.addr());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let message = PexMessage { added: vec![(addr("1.2.3.4:6881"), FLAG_SEED)], dropped: vec![] };
        let mut expected = b"d5:added6:".to_vec();
        expected.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1]);
        expected.extend_from_slice(b"7:added.f1:\x026:added60:8:added6.f0:7:dropped0:8:dropped60:e");
        assert_eq!(message.encode(), expected);
    }

    #[test]
    fn test_decode_mixed_families() {
        let message = PexMessage {
            added: vec![
                (addr("10.0.0.1:5000"), FLAG_ENCRYPTION | FLAG_OUTGOING),
                (addr("[2001:db8::1]:6000"), FLAG_UTP),
            ],
            dropped: vec![addr("10.0.0.2:5001")],
        };
        let decoded = PexMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_missing_flags_default_to_zero() {
        let mut payload = b"d5:added6:".to_vec();
        payload.extend_from_slice(&[9, 9, 9, 9, 0, 80]);
        payload.push(b'e');
        let decoded = PexMessage::decode(&payload).unwrap();
        assert_eq!(decoded.added, vec![(addr("9.9.9.9:80"), 0)]);
    }

    #[test]
    fn test_bad_compact_length() {
        assert!(PexMessage::decode(b"d5:added5:abcdee").is_err());
        assert!(PexMessage::decode(b"le").is_err());
    }

    #[test]
    fn test_state_diffs_and_rate_limits() {
        let mut state = PexState::new();
        let first = vec![(addr("1.1.1.1:1"), 0), (addr("2.2.2.2:2"), FLAG_SEED)];
        let message = state.prepare(&first).unwrap();
        assert_eq!(message.added.len(), 2);
        assert!(message.dropped.is_empty());

        assert!(!state.due());
        assert!(state.prepare(&[(addr("3.3.3.3:3"), 0)]).is_none());

        state.last_sent = Some(Instant::now() - PEX_INTERVAL);
        let message = state.prepare(&[(addr("2.2.2.2:2"), FLAG_SEED), (addr("3.3.3.3:3"), 0)]).unwrap();
        assert_eq!(message.added, vec![(addr("3.3.3.3:3"), 0)]);
        assert_eq!(message.dropped, vec![addr("1.1.1.1:1")]);
    }

    #[test]
    fn test_state_caps_message_size() {
        let mut state = PexState::new();
        let many: Vec<(SocketAddr, u8)> =
            (0..120u16).map(|i| (SocketAddr::new("10.0.0.1".parse().unwrap(), 1000 + i), 0)).collect();
        let message = state.prepare(&many).unwrap();
        assert_eq!(message.added.len(), MAX_PEX_PEERS);
    }
}
