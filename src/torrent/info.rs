//! Torrent information structures
//!
//! Provides high-level information about torrents, built from the raw
//! `info` dictionary so the same bytes can be served over ut_metadata.

use anyhow::Result;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::bencode::{self, BencodeDict};
use crate::error::TorrentError;

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// A file placed in the torrent's contiguous byte space
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSpan {
    pub path: Vec<String>,
    pub offset: u64,
    pub length: u64,
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: Option<String>,
    /// Every tracker announce URL, primary first, without duplicates
    pub announce_list: Vec<String>,
    /// SHA1 hash of info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
    /// Private torrents are announced to their trackers only
    pub private: bool,
    /// The bencoded `info` dictionary exactly as hashed
    pub raw_info: Vec<u8>,
}

impl TorrentInfo {
    /// Build from a bencoded `info` dictionary
    pub fn from_info_bytes(raw_info: &[u8], announce_list: Vec<String>) -> Result<Self> {
        let value = bencode::decode(raw_info)?;
        let info = value
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Info must be a dictionary"))?;
        Self::from_info_dict(info, raw_info.to_vec(), announce_list)
    }

    pub(crate) fn from_info_dict(info: &BencodeDict, raw_info: Vec<u8>, announce_list: Vec<String>) -> Result<Self> {
        let name = info
            .get_bytes("name")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;

        let piece_length = info
            .get_integer("piece length")
            .filter(|l| *l > 0)
            .ok_or_else(|| TorrentError::parse_error("Missing or invalid piece length"))? as u64;

        let pieces_bytes = info
            .get_bytes("pieces")
            .ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let (length, files) = if let Some(len) = info.get_integer("length") {
            if len < 0 {
                return Err(TorrentError::parse_error("Negative length").into());
            }
            (Some(len as u64), None)
        } else if let Some(file_list) = info.get_list("files") {
            let mut torrent_files = Vec::with_capacity(file_list.len());
            for entry in file_list {
                let file = entry
                    .as_dict()
                    .ok_or_else(|| TorrentError::parse_error("File entry is not a dictionary"))?;
                let length = file
                    .get_integer("length")
                    .filter(|l| *l >= 0)
                    .ok_or_else(|| TorrentError::parse_error("Missing file length"))? as u64;
                let path: Vec<String> = file
                    .get_list("path")
                    .ok_or_else(|| TorrentError::parse_error("Missing file path"))?
                    .iter()
                    .filter_map(|c| c.as_bytes())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .collect();
                if path.is_empty() {
                    return Err(TorrentError::parse_error("Empty file path").into());
                }
                torrent_files.push(TorrentFile { path, length });
            }
            (None, Some(torrent_files))
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        let mut announce_list = announce_list;
        let mut seen = std::collections::HashSet::new();
        announce_list.retain(|url| seen.insert(url.clone()));

        Ok(TorrentInfo {
            announce: announce_list.first().cloned(),
            announce_list,
            info_hash: Self::generate_info_hash(&raw_info),
            piece_length,
            pieces,
            name,
            length,
            files,
            private: info.get_integer("private") == Some(1),
            raw_info,
        })
    }

    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Get an iterator over all files in torrent
    pub fn files_iter(&self) -> impl Iterator<Item = TorrentFile> + '_ {
        let single = self.length.map(|length| TorrentFile { path: vec![self.name.clone()], length });
        self.files.iter().flatten().cloned().chain(single)
    }

    /// Files with their offsets in the torrent's byte space
    pub fn file_layout(&self) -> Vec<FileSpan> {
        let mut offset = 0;
        self.files_iter()
            .map(|f| {
                let span = FileSpan { path: f.path, offset, length: f.length };
                offset += f.length;
                span
            })
            .collect()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        Sha1::digest(info_dict_bytes).into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ))
            .into());
        }
        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_size());
        Some((start, end))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bencode::BencodeValue;

    /// Bencoded single-file info dictionary
    pub(crate) fn sample_info(name: &str, length: i64, piece_length: i64) -> Vec<u8> {
        let pieces = ((length + piece_length - 1) / piece_length) as usize;
        let mut dict = BencodeDict::new();
        dict.insert("length", length);
        dict.insert("name", name);
        dict.insert("piece length", piece_length);
        dict.insert("pieces", vec![0xABu8; pieces * 20]);
        bencode::encode(&BencodeValue::Dict(dict))
    }

    #[test]
    fn test_single_file_info() {
        let raw = sample_info("test.bin", 1500, 1024);
        let info = TorrentInfo::from_info_bytes(&raw, vec!["http://t/announce".to_string()]).unwrap();

        assert_eq!(info.total_size(), 1500);
        assert_eq!(info.piece_count(), 2);
        assert!(!info.is_multi_file());
        assert!(!info.private);
        assert_eq!(info.info_hash, TorrentInfo::generate_info_hash(&raw));
        assert_eq!(info.raw_info, raw);
        assert_eq!(info.announce.as_deref(), Some("http://t/announce"));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
    }

    #[test]
    fn test_multi_file_layout() {
        let mut file_a = BencodeDict::new();
        file_a.insert("length", 500i64);
        file_a.insert("path", vec![BencodeValue::from("dir"), BencodeValue::from("a.txt")]);
        let mut file_b = BencodeDict::new();
        file_b.insert("length", 524i64);
        file_b.insert("path", vec![BencodeValue::from("b.txt")]);

        let mut dict = BencodeDict::new();
        dict.insert("files", vec![BencodeValue::from(file_a), BencodeValue::from(file_b)]);
        dict.insert("name", "multi");
        dict.insert("piece length", 1024i64);
        dict.insert("pieces", vec![0u8; 20]);
        dict.insert("private", 1i64);
        let raw = bencode::encode(&BencodeValue::Dict(dict));

        let info = TorrentInfo::from_info_bytes(&raw, Vec::new()).unwrap();
        assert!(info.is_multi_file());
        assert!(info.private);
        assert_eq!(info.total_size(), 1024);
        assert_eq!(
            info.file_layout(),
            vec![
                FileSpan { path: vec!["dir".into(), "a.txt".into()], offset: 0, length: 500 },
                FileSpan { path: vec!["b.txt".into()], offset: 500, length: 524 },
            ]
        );
    }

    #[test]
    fn test_duplicate_trackers_removed() {
        let raw = sample_info("x", 10, 16);
        let trackers = vec!["udp://a:1".to_string(), "udp://b:2".to_string(), "udp://a:1".to_string()];
        let info = TorrentInfo::from_info_bytes(&raw, trackers).unwrap();
        assert_eq!(info.announce_list, vec!["udp://a:1".to_string(), "udp://b:2".to_string()]);
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentInfo::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);
        assert!(TorrentInfo::parse_piece_hashes(&[1u8; 21]).is_err());
    }

    #[test]
    fn test_missing_fields() {
        assert!(TorrentInfo::from_info_bytes(b"d4:name1:xe", Vec::new()).is_err());
        assert!(TorrentInfo::from_info_bytes(b"le", Vec::new()).is_err());
    }
}
