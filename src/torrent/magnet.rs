//! Magnet link parser
//!
//! Handles parsing of magnet: URIs to extract the info-hash, display name,
//! trackers and directly given peers.

use anyhow::Result;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;

/// Parsed magnet link information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetInfo {
    /// SHA1 info hash from the magnet link
    pub info_hash: [u8; 20],
    /// Display name (dn parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (tr parameters)
    pub trackers: Vec<String>,
    /// Peers to contact directly (x.pe parameters)
    pub peers: Vec<SocketAddr>,
    /// Total file size in bytes (xl parameter)
    pub total_size: Option<u64>,
}

impl MagnetInfo {
    /// Display name, or the hex info-hash when the link carries none
    pub fn name(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| hex::encode(self.info_hash))
    }
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny";
    /// let info = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetInfo> {
        info!("Parsing magnet link: {}", magnet_uri);

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::parse_error_with_source("Invalid magnet URL format", e.to_string())
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(TorrentError::parse_error(format!("Not a magnet link: scheme '{}'", url.scheme())).into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        let mut total_size = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        debug!("Extracted info hash: {}", hex::encode(hash));
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if !trackers.iter().any(|t| t == &value) {
                        trackers.push(value.into_owned());
                    }
                }
                "x.pe" => match value.parse::<SocketAddr>() {
                    Ok(addr) => peers.push(addr),
                    Err(_) => warn!("Ignoring unparseable peer address: {}", value),
                },
                "xl" => match value.parse::<u64>() {
                    Ok(size) => total_size = Some(size),
                    Err(_) => warn!("Invalid xl parameter value: {}", value),
                },
                other => debug!("Ignoring unknown parameter: {}", other),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            TorrentError::parse_error("Magnet link must contain an info hash (xt=urn:btih:<hash>)")
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetInfo { info_hash, display_name, trackers, peers, total_size })
    }

    /// Extract info hash from an xt parameter value
    ///
    /// The value has the form `urn:btih:<hash>` where the hash is 40 hex
    /// characters or 32 base32 characters.
    fn extract_info_hash(xt_value: &str) -> Result<Option<[u8; 20]>> {
        let Some(hash_str) = xt_value.strip_prefix("urn:btih:") else {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        };

        let bytes = match hash_str.len() {
            40 => hex::decode(hash_str)
                .map_err(|e| TorrentError::parse_error_with_source("Invalid hex info hash", e.to_string()))?,
            32 => base32_decode(hash_str).ok_or_else(|| TorrentError::parse_error("Invalid base32 info hash"))?,
            len => {
                return Err(TorrentError::parse_error(format!(
                    "Info hash has invalid length: {} (expected 40 hex or 32 base32 characters)",
                    len
                ))
                .into())
            }
        };

        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::parse_error("Info hash does not decode to 20 bytes"))?;
        Ok(Some(hash))
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:?") || input.trim().starts_with("magnet://")
    }
}

/// RFC 4648 base32, case-insensitive, padding optional
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.trim_end_matches('=');
    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c.to_ascii_uppercase())? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIG_BUCK_BUNNY_MAGNET: &str = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny&tr=udp%3A%2F%2Fexplodie.org%3A6969&tr=udp%3A%2F%2Ftracker.coppersurfer.tk%3A6969&tr=udp%3A%2F%2Ftracker.opentrackr.org%3A1337&tr=wss%3A%2F%2Ftracker.btorrent.xyz&ws=https%3A%2F%2Fwebtorrent.io%2Ftorrents%2F";

    #[test]
    fn test_parse_big_buck_bunny_magnet() {
        let info = MagnetParser::parse(BIG_BUCK_BUNNY_MAGNET).unwrap();
        assert_eq!(hex::encode(info.info_hash), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
        assert_eq!(info.display_name, Some("Big Buck Bunny".to_string()));
        assert_eq!(info.trackers.len(), 4);
        assert_eq!(info.trackers[0], "udp://explodie.org:6969");
        assert_eq!(info.name(), "Big Buck Bunny");
    }

    #[test]
    fn test_parse_simple_magnet() {
        let info = MagnetParser::parse("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").unwrap();
        assert!(info.display_name.is_none());
        assert!(info.trackers.is_empty());
        assert_eq!(info.name(), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
    }

    #[test]
    fn test_base32_info_hash() {
        // Base32 of 0xdd8255ecdc7ca55fb0bbf81323d87062db1f6d1c
        let magnet = "magnet:?xt=urn:btih:3WBFL3G4PSSV7MF37AJSHWDQMLNR63I4";
        let info = MagnetParser::parse(magnet).unwrap();
        assert_eq!(hex::encode(info.info_hash), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");

        let lower = MagnetParser::parse(&magnet.to_lowercase()).unwrap();
        assert_eq!(lower.info_hash, info.info_hash);
    }

    #[test]
    fn test_peers_and_size() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&x.pe=10.0.0.1:6881&x.pe=bogus&xl=1234567890&tr=http://t1&tr=http://t1";
        let info = MagnetParser::parse(magnet).unwrap();
        assert_eq!(info.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
        assert_eq!(info.total_size, Some(1234567890));
        assert_eq!(info.trackers, vec!["http://t1".to_string()]);
    }

    #[test]
    fn test_invalid_magnets() {
        assert!(MagnetParser::parse("magnet:?dn=Test+Torrent&tr=http://tracker.com").is_err());
        assert!(MagnetParser::parse("not-a-magnet-link").is_err());
        assert!(MagnetParser::parse("http:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").is_err());
        assert!(MagnetParser::parse("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d").is_err());
        assert!(MagnetParser::parse("magnet:?xt=urn:btih:1WBFL3G4PSSV7MF37AJSHWDQMLNR63I4").is_err());
    }

    #[test]
    fn test_is_magnet_link() {
        assert!(MagnetParser::is_magnet_link("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c"));
        assert!(MagnetParser::is_magnet_link("  magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c  "));
        assert!(!MagnetParser::is_magnet_link("http://example.com"));
        assert!(!MagnetParser::is_magnet_link("example.torrent"));
    }

    #[test]
    fn test_non_bittorrent_xt_is_skipped() {
        assert!(MagnetParser::extract_info_hash("urn:sha1:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").unwrap().is_none());
    }
}
