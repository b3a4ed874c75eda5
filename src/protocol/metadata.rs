//! ut_metadata
//!
//! Transfers the `info` dictionary in 16 KiB pieces so a torrent added by
//! magnet link can learn its metadata from the swarm.

use anyhow::Result;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bencode::{self, BencodeDict, BencodeValue};
use crate::error::TorrentError;
use crate::protocol::extension::{ExtensionContext, ExtensionHandler, ExtensionType};

/// Metadata piece size
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Largest metadata we are willing to assemble
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// A piece requested this long ago may be requested again
pub const REQUEST_RETRY: Duration = Duration::from_secs(30);

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// ut_metadata message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn piece(&self) -> u32 {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    /// Bencoded header, followed by the raw piece for `Data`
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, total_size) = match self {
            MetadataMessage::Request { .. } => (MSG_REQUEST, None),
            MetadataMessage::Data { total_size, .. } => (MSG_DATA, Some(*total_size)),
            MetadataMessage::Reject { .. } => (MSG_REJECT, None),
        };

        let mut dict = BencodeDict::new();
        dict.insert("msg_type", msg_type);
        dict.insert("piece", i64::from(self.piece()));
        if let Some(size) = total_size {
            dict.insert("total_size", size as i64);
        }
        let mut out = bencode::encode(&BencodeValue::Dict(dict));
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, consumed) = bencode::decode_prefix(payload)?;
        let dict = header
            .as_dict()
            .ok_or_else(|| TorrentError::malformed("ut_metadata header is not a dictionary"))?;
        let msg_type = dict
            .get_integer("msg_type")
            .ok_or_else(|| TorrentError::malformed("ut_metadata message without msg_type"))?;
        let piece = dict
            .get_integer("piece")
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| TorrentError::malformed("ut_metadata message without a valid piece"))?;

        match msg_type {
            MSG_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_DATA => {
                let total_size = dict
                    .get_integer("total_size")
                    .and_then(|s| usize::try_from(s).ok())
                    .ok_or_else(|| TorrentError::malformed("ut_metadata data without total_size"))?;
                Ok(MetadataMessage::Data { piece, total_size, data: payload[consumed..].to_vec() })
            }
            MSG_REJECT => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::unsupported_extension(format!("ut_metadata msg_type {}", other)).into()),
        }
    }
}

/// Number of pieces for `size` bytes of metadata
pub fn piece_count(size: usize) -> usize {
    size.div_ceil(METADATA_PIECE_SIZE)
}

/// Slice `piece` out of complete metadata
pub fn piece_of(metadata: &[u8], piece: u32) -> Option<&[u8]> {
    let start = piece as usize * METADATA_PIECE_SIZE;
    if start >= metadata.len() {
        return None;
    }
    let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
    Some(&metadata[start..end])
}

/// Outcome of storing one piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyProgress {
    Pending,
    /// All pieces present and the hash matches
    Complete(Vec<u8>),
    /// All pieces present but the hash does not match; the pieces were dropped
    Corrupt,
}

/// Collects metadata pieces from any number of peers
#[derive(Debug)]
pub struct MetadataAssembler {
    size: usize,
    pieces: Vec<Option<Vec<u8>>>,
    requested: Vec<Option<Instant>>,
}

impl MetadataAssembler {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 || size > MAX_METADATA_SIZE {
            return Err(TorrentError::protocol_violation(format!("Unacceptable metadata size {}", size)).into());
        }
        let count = piece_count(size);
        Ok(Self { size, pieces: vec![None; count], requested: vec![None; count] })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn received(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_some()).count()
    }

    fn expected_len(&self, piece: usize) -> usize {
        if piece + 1 == self.pieces.len() {
            self.size - piece * METADATA_PIECE_SIZE
        } else {
            METADATA_PIECE_SIZE
        }
    }

    /// Next piece worth requesting, marked as requested
    pub fn next_request(&mut self) -> Option<u32> {
        let now = Instant::now();
        let index = (0..self.pieces.len()).find(|&i| {
            self.pieces[i].is_none() && self.requested[i].map_or(true, |at| now.duration_since(at) >= REQUEST_RETRY)
        })?;
        self.requested[index] = Some(now);
        Some(index as u32)
    }

    /// A peer refused `piece`; make it requestable again
    pub fn reject(&mut self, piece: u32) {
        if let Some(slot) = self.requested.get_mut(piece as usize) {
            *slot = None;
        }
    }

    /// Store one piece and check the whole once it is complete
    pub fn add(&mut self, piece: u32, data: &[u8], info_hash: &[u8; 20]) -> Result<AssemblyProgress> {
        let index = piece as usize;
        if index >= self.pieces.len() {
            return Err(TorrentError::protocol_violation(format!("Metadata piece {} out of range", piece)).into());
        }
        if data.len() != self.expected_len(index) {
            return Err(TorrentError::protocol_violation(format!(
                "Metadata piece {} has {} bytes, expected {}",
                piece,
                data.len(),
                self.expected_len(index)
            ))
            .into());
        }
        self.pieces[index] = Some(data.to_vec());

        if self.pieces.iter().any(Option::is_none) {
            return Ok(AssemblyProgress::Pending);
        }

        let metadata: Vec<u8> = self.pieces.iter().flatten().flatten().copied().collect();
        let digest: [u8; 20] = Sha1::digest(&metadata).into();
        if &digest != info_hash {
            warn!("Assembled metadata does not match {}", hex::encode(info_hash));
            self.pieces.iter_mut().for_each(|p| *p = None);
            self.requested.iter_mut().for_each(|r| *r = None);
            return Ok(AssemblyProgress::Corrupt);
        }
        Ok(AssemblyProgress::Complete(metadata))
    }
}

/// Ask the peer for the next missing piece, if any
pub fn request_next(ctx: &ExtensionContext) -> Result<bool> {
    if !ctx.sender.supports(ExtensionType::UtMetadata) {
        return Ok(false);
    }
    match ctx.torrent.next_metadata_request() {
        Some(piece) => {
            ctx.sender.send(ExtensionType::UtMetadata, MetadataMessage::Request { piece }.encode())?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// ut_metadata handler: serves our metadata, assembles the peer's
pub struct MetadataHandler;

#[async_trait]
impl ExtensionHandler for MetadataHandler {
    fn extension(&self) -> ExtensionType {
        ExtensionType::UtMetadata
    }

    async fn handle(&self, payload: &[u8], ctx: &ExtensionContext) -> Result<()> {
        let message = MetadataMessage::decode(payload)?;
        match message {
            MetadataMessage::Request { piece } => {
                let reply = match ctx.torrent.metadata_piece(piece) {
                    Some((data, total_size)) => MetadataMessage::Data { piece, total_size, data },
                    None => MetadataMessage::Reject { piece },
                };
                ctx.sender.send(ExtensionType::UtMetadata, reply.encode())
            }
            MetadataMessage::Data { piece, total_size, data } => {
                ctx.torrent.expect_metadata(total_size)?;
                match ctx.torrent.add_metadata_piece(piece, &data)? {
                    AssemblyProgress::Complete(_) => {
                        info!("Metadata for {} received via {}", hex::encode(ctx.torrent.info_hash()), ctx.peer.addr());
                        Ok(())
                    }
                    AssemblyProgress::Pending | AssemblyProgress::Corrupt => request_next(ctx).map(|_| ()),
                }
            }
            MetadataMessage::Reject { piece } => {
                debug!("{} rejected metadata piece {}", ctx.peer.addr(), piece);
                ctx.torrent.reject_metadata_piece(piece);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_and_reject_encoding() {
        assert_eq!(MetadataMessage::Request { piece: 0 }.encode(), b"d8:msg_typei0e5:piecei0ee".to_vec());
        assert_eq!(MetadataMessage::Reject { piece: 3 }.encode(), b"d8:msg_typei2e5:piecei3ee".to_vec());
    }

    #[test]
    fn test_data_carries_trailing_bytes() {
        let message = MetadataMessage::Data { piece: 1, total_size: 20_000, data: vec![7u8; 3616] };
        let bytes = message.encode();
        assert!(bytes.starts_with(b"d8:msg_typei1e5:piecei1e10:total_sizei20000ee"));
        assert_eq!(MetadataMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_decode_errors() {
        assert!(MetadataMessage::decode(b"d5:piecei0ee").is_err());
        assert!(MetadataMessage::decode(b"d8:msg_typei1e5:piecei0ee").is_err());
        assert!(MetadataMessage::decode(b"d8:msg_typei9e5:piecei0ee").is_err());
    }

    #[test]
    fn test_assembler_completes_with_matching_hash() {
        let metadata: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let info_hash: [u8; 20] = Sha1::digest(&metadata).into();
        let mut assembler = MetadataAssembler::new(metadata.len()).unwrap();
        assert_eq!(assembler.piece_count(), 3);

        assert_eq!(assembler.next_request(), Some(0));
        assert_eq!(assembler.next_request(), Some(1));
        assert_eq!(assembler.next_request(), Some(2));
        assert_eq!(assembler.next_request(), None);
        assembler.reject(1);
        assert_eq!(assembler.next_request(), Some(1));

        for piece in [2u32, 0] {
            let data = piece_of(&metadata, piece).unwrap();
            assert_eq!(assembler.add(piece, data, &info_hash).unwrap(), AssemblyProgress::Pending);
        }
        let last = assembler.add(1, piece_of(&metadata, 1).unwrap(), &info_hash).unwrap();
        assert_eq!(last, AssemblyProgress::Complete(metadata));
    }

    #[test]
    fn test_assembler_detects_corruption() {
        let metadata = vec![1u8; 100];
        let mut assembler = MetadataAssembler::new(100).unwrap();
        assert_eq!(assembler.add(0, &metadata, &[0u8; 20]).unwrap(), AssemblyProgress::Corrupt);
        assert_eq!(assembler.received(), 0);
        assert!(assembler.add(0, &metadata[..50], &[0u8; 20]).is_err());
        assert!(assembler.add(1, &metadata, &[0u8; 20]).is_err());
    }

    #[test]
    fn test_size_limits() {
        assert!(MetadataAssembler::new(0).is_err());
        assert!(MetadataAssembler::new(MAX_METADATA_SIZE + 1).is_err());
        assert_eq!(piece_count(METADATA_PIECE_SIZE), 1);
        assert_eq!(piece_count(METADATA_PIECE_SIZE + 1), 2);
        assert!(piece_of(&[0u8; 10], 1).is_none());
    }
}
