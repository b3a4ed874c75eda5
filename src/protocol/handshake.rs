//! BitTorrent handshake protocol
//!
//! The fixed 68-byte handshake, the reserved capability bytes and the
//! locally advertised capability set.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake length on the wire
pub const HANDSHAKE_LENGTH: usize = 68;

/// Azureus-style prefix of our peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-SE0100-";

/// Client name announced in the extension handshake
pub const CLIENT_NAME: &str = "swarm-engine 0.1.0";

/// Byte 5: extension protocol (LTEP)
pub const EXTENSION_PROTOCOL: u8 = 0x10;
/// Byte 7: mainline DHT
pub const DHT_PROTOCOL: u8 = 0x01;
/// Byte 7: peer exchange
pub const PEER_EXCHANGE: u8 = 0x02;
/// Byte 7: fast extension
pub const FAST_PROTOCOL: u8 = 0x04;
/// Byte 7: NAT traversal
pub const NAT_TRAVERSAL: u8 = 0x08;

/// The 8 reserved handshake bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reserved(pub [u8; 8]);

impl Reserved {
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn supports_extensions(&self) -> bool {
        self.0[5] & EXTENSION_PROTOCOL != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.0[7] & DHT_PROTOCOL != 0
    }

    pub fn supports_pex(&self) -> bool {
        self.0[7] & PEER_EXCHANGE != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.0[7] & FAST_PROTOCOL != 0
    }

    pub fn supports_nat_traversal(&self) -> bool {
        self.0[7] & NAT_TRAVERSAL != 0
    }

    /// Capabilities both sides advertise
    pub fn intersect(&self, other: &Reserved) -> Reserved {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.0[i] & other.0[i];
        }
        Reserved(bytes)
    }

    fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

/// Capabilities this node advertises
///
/// The reserved bytes are the union of every enabled capability and are
/// recomputed on each toggle, so a handshake built after
/// [`set_nat_traversal`](Self::set_nat_traversal) sees the new value.
#[derive(Debug)]
pub struct LocalCapabilities {
    dht: AtomicBool,
    pex: AtomicBool,
    fast: AtomicBool,
    nat_traversal: AtomicBool,
    reserved: AtomicU64,
}

impl LocalCapabilities {
    pub fn new(dht: bool, pex: bool, fast: bool) -> Self {
        let caps = Self {
            dht: AtomicBool::new(dht),
            pex: AtomicBool::new(pex),
            fast: AtomicBool::new(fast),
            nat_traversal: AtomicBool::new(false),
            reserved: AtomicU64::new(0),
        };
        caps.recompute();
        caps
    }

    fn recompute(&self) {
        let mut bytes = [0u8; 8];
        bytes[5] |= EXTENSION_PROTOCOL;
        if self.dht.load(Ordering::Acquire) {
            bytes[7] |= DHT_PROTOCOL;
        }
        if self.pex.load(Ordering::Acquire) {
            bytes[7] |= PEER_EXCHANGE;
        }
        if self.fast.load(Ordering::Acquire) {
            bytes[7] |= FAST_PROTOCOL;
        }
        if self.nat_traversal.load(Ordering::Acquire) {
            bytes[7] |= NAT_TRAVERSAL;
        }
        self.reserved.store(Reserved(bytes).to_u64(), Ordering::Release);
    }

    /// Current reserved bytes
    pub fn reserved(&self) -> Reserved {
        Reserved::from_u64(self.reserved.load(Ordering::Acquire))
    }

    pub fn set_dht(&self, enabled: bool) {
        self.dht.store(enabled, Ordering::Release);
        self.recompute();
    }

    /// Toggle NAT traversal (holepunch) support at runtime
    pub fn set_nat_traversal(&self, enabled: bool) {
        if self.nat_traversal.swap(enabled, Ordering::AcqRel) != enabled {
            debug!("NAT traversal {}", if enabled { "enabled" } else { "disabled" });
        }
        self.recompute();
    }

    pub fn nat_traversal(&self) -> bool {
        self.nat_traversal.load(Ordering::Acquire)
    }

    pub fn fast(&self) -> bool {
        self.fast.load(Ordering::Acquire)
    }
}

impl Default for LocalCapabilities {
    fn default() -> Self {
        Self::new(true, true, false)
    }
}

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Capability bits
    pub reserved: Reserved,
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake with no capability bits set
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self::with_reserved(info_hash, peer_id, Reserved::default())
    }

    pub fn with_reserved(info_hash: [u8; 20], peer_id: [u8; 20], reserved: Reserved) -> Self {
        trace!("Creating handshake for info_hash {} reserved {}", hex::encode(info_hash), hex::encode(reserved.0));
        Self { reserved, info_hash, peer_id }
    }

    /// Generate a random peer ID with our client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved.0);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from exactly [`HANDSHAKE_LENGTH`] bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LENGTH {
            return Err(TorrentError::protocol_violation(format!(
                "Handshake too short: expected {} bytes, got {}",
                HANDSHAKE_LENGTH,
                data.len()
            ))
            .into());
        }

        if data[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_violation(format!(
                "Invalid protocol length: expected {}, got {}",
                PROTOCOL_LENGTH, data[0]
            ))
            .into());
        }

        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::protocol_violation("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake from peer {} for {} reserved {}",
            hex::encode(peer_id),
            hex::encode(info_hash),
            hex::encode(reserved)
        );
        Ok(Self { reserved: Reserved(reserved), info_hash, peer_id })
    }

    /// Check the info hash against the one we expect
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

/// Client name from an Azureus-style peer id prefix
pub fn client_name(peer_id: &[u8]) -> &'static str {
    if peer_id.len() < 3 {
        return "unknown";
    }
    match &peer_id[..3] {
        b"-AG" | b"-A~" => "Ares",
        b"-AR" => "Arctic",
        b"-AV" => "Avicora",
        b"-AX" => "BitPump",
        b"-AZ" => "Azureus",
        b"-BB" => "BitBuddy",
        b"-BC" => "BitComet",
        b"-BF" => "Bitflu",
        b"-BG" => "BTG",
        b"-BR" => "BitRocket",
        b"-BS" => "BTSlave",
        b"-BX" => "Bittorrent X",
        b"-CD" => "Enhanced CTorrent",
        b"-CT" => "CTorrent",
        b"-DE" => "DelugeTorrent",
        b"-EB" => "EBit",
        b"-ES" => "electric sheep",
        b"-FT" => "FoxTorrent",
        b"-HL" => "Halite",
        b"-KT" => "KTorrent",
        b"-LP" => "Lphant",
        b"-LT" => "libtorrent",
        b"-lt" => "libTorrent",
        b"-MP" => "MooPolice",
        b"-MT" => "MoonlightTorrent",
        b"-PD" => "Pando",
        b"-qB" => "qBittorrent",
        b"-QT" => "Qt 4 Torrent example",
        b"-RT" => "Retriever",
        b"-SB" => "Swiftbit",
        b"-SE" => "swarm-engine",
        b"-SS" => "SwarmScope",
        b"-ST" => "SymTorrent",
        b"-TN" => "TorrentDotNET",
        b"-TR" => "Transmission",
        b"-TS" => "Torrentstorm",
        b"-UL" => "uLeecher!",
        b"-UT" => "µTorrent",
        b"-UM" => "µTorrent for Mac",
        b"-WT" => "BitLet",
        b"-WY" => "FireTorrent",
        b"-XL" => "Xunlei",
        b"-XT" => "XanTorrent",
        b"-XX" => "Xtorrent",
        b"-ZT" => "ZipTorrent",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialize_deserialize() {
        let reserved = LocalCapabilities::default().reserved();
        let handshake = Handshake::with_reserved([1u8; 20], [2u8; 20], reserved);

        let serialized = handshake.serialize();
        assert_eq!(serialized.len(), HANDSHAKE_LENGTH);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &reserved.0);

        let deserialized = Handshake::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_deserialize_rejects_bad_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'x';
        assert!(Handshake::deserialize(&bytes).is_err());

        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[0] = 18;
        assert!(Handshake::deserialize(&bytes).is_err());

        assert!(Handshake::deserialize(&bytes[..40]).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
        assert_eq!(client_name(&peer_id), "swarm-engine");
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }

    #[test]
    fn test_local_reserved_bits() {
        let caps = LocalCapabilities::new(true, true, false);
        let reserved = caps.reserved();
        assert!(reserved.supports_extensions());
        assert!(reserved.supports_dht());
        assert!(reserved.supports_pex());
        assert!(!reserved.supports_fast());
        assert_eq!(reserved.0[5], 0x10);
        assert_eq!(reserved.0[7], 0x03);
    }

    #[test]
    fn test_nat_traversal_toggle_recomputes() {
        let caps = LocalCapabilities::default();
        assert!(!caps.reserved().supports_nat_traversal());
        caps.set_nat_traversal(true);
        assert!(caps.reserved().supports_nat_traversal());
        caps.set_nat_traversal(false);
        assert!(!caps.reserved().supports_nat_traversal());
        caps.set_dht(false);
        assert!(!caps.reserved().supports_dht());
    }

    #[test]
    fn test_intersect() {
        let ours = LocalCapabilities::new(true, false, true).reserved();
        let theirs = Reserved::new([0, 0, 0, 0, 0, 0x10, 0, 0x01]);
        let both = ours.intersect(&theirs);
        assert!(both.supports_dht());
        assert!(both.supports_extensions());
        assert!(!both.supports_fast());
    }

    #[test]
    fn test_client_name() {
        assert_eq!(client_name(b"-qB4250-abcdefghijkl"), "qBittorrent");
        assert_eq!(client_name(b"-TR3000-abcdefghijkl"), "Transmission");
        assert_eq!(client_name(b"M7-2-2--abcdefghijkl"), "unknown");
        assert_eq!(client_name(b"-q"), "unknown");
    }
}
