//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use anyhow::Result;
use std::path::Path;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, BencodeValue};
use crate::error::TorrentError;
use crate::torrent::info::TorrentInfo;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data)
            .map_err(|e| TorrentError::parse_error_with_source("Invalid torrent file", e.to_string()))?;
        let root = root
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Root must be a dictionary"))?;

        let info_value = root
            .get("info")
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Info must be a dictionary"))?;

        // Dictionaries keep their order, so re-encoding gives the hashed bytes
        let raw_info = bencode::encode(info_value);
        let torrent = TorrentInfo::from_info_dict(info_dict, raw_info, Self::trackers(root))?;

        info!("Parsed torrent {} ({})", torrent.name, torrent.info_hash_hex());
        debug!(
            "{} pieces of {} bytes, {} trackers",
            torrent.piece_count(),
            torrent.piece_length,
            torrent.announce_list.len()
        );
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::parse_error_with_source(format!("Failed to read {}", path.display()), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    /// `announce` followed by every tier of `announce-list`
    fn trackers(root: &bencode::BencodeDict) -> Vec<String> {
        let mut trackers: Vec<String> = root.get_str("announce").map(str::to_string).into_iter().collect();
        for tier in root.get_list("announce-list").unwrap_or_default() {
            for url in tier.as_list().unwrap_or_default() {
                if let Some(url) = url.as_str() {
                    trackers.push(url.to_string());
                }
            }
        }
        trackers.retain(|t| !t.is_empty());
        trackers
    }
}

/// Bencode a minimal `.torrent` around an info dictionary
pub fn build_torrent(announce: Option<&str>, raw_info: &[u8]) -> Result<Vec<u8>> {
    let info = bencode::decode(raw_info)?;
    let mut root = bencode::BencodeDict::new();
    if let Some(url) = announce {
        root.insert("announce", url);
    }
    root.insert("info", info);
    Ok(bencode::encode(&BencodeValue::Dict(root)))
}
