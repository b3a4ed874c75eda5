//! Tracker module
//!
//! Announce and scrape against HTTP and UDP trackers, the per-URL client
//! pool and the per-torrent launchers that schedule re-announces.

pub mod client;
#[cfg(feature = "http-tracker")]
pub mod http;
pub mod launcher;
pub mod manager;
pub mod udp;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TorrentError;

pub use client::{TrackerClient, MAX_TRACKER_FAILURES};
#[cfg(feature = "http-tracker")]
pub use http::HttpTracker;
pub use launcher::{TrackerLauncher, DEFAULT_INTERVAL, MAX_INTERVAL, MIN_INTERVAL};
pub use manager::{TrackerManager, DEFAULT_TRACKER_SIZE};
pub use udp::UdpTracker;

/// Lifecycle event carried by an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    /// Regular re-announce
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl TrackerEvent {
    /// Value of the HTTP `event` parameter; `None` omits it
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            TrackerEvent::None => None,
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::Stopped => Some("stopped"),
        }
    }

    /// Event code of a UDP announce
    pub fn udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().unwrap_or("empty"))
    }
}

/// Transport protocol of an announce URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerProtocol {
    Http,
    Udp,
}

impl TrackerProtocol {
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split_once("://")?.0.to_ascii_lowercase();
        match scheme.as_str() {
            "http" | "https" => Some(TrackerProtocol::Http),
            "udp" => Some(TrackerProtocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for TrackerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerProtocol::Http => write!(f, "http"),
            TrackerProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    /// Peers wanted; -1 lets the tracker decide
    pub numwant: i32,
    pub key: u32,
}

impl AnnounceRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: TrackerEvent::None,
            numwant: -1,
            key: 0,
        }
    }

    pub fn with_event(mut self, event: TrackerEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_transfer(mut self, uploaded: u64, downloaded: u64, left: u64) -> Self {
        self.uploaded = uploaded;
        self.downloaded = downloaded;
        self.left = left;
        self
    }
}

/// What a tracker answered to an announce
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until the next regular announce
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeders
    pub complete: Option<u32>,
    /// Leechers
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub warning: Option<String>,
    pub tracker_id: Option<String>,
}

/// Swarm counters of one torrent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub complete: u32,
    pub downloaded: u32,
    pub incomplete: u32,
}

/// One way of talking to a tracker
#[async_trait]
pub trait TrackerTransport: Send + Sync {
    /// Announce URL this transport talks to
    fn url(&self) -> &str;

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse>;

    async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeResponse>;
}

/// Build the transport matching the scheme of `url`
pub fn open_transport(url: &str) -> Result<Arc<dyn TrackerTransport>> {
    match TrackerProtocol::from_url(url) {
        Some(TrackerProtocol::Udp) => Ok(Arc::new(UdpTracker::new(url)?)),
        #[cfg(feature = "http-tracker")]
        Some(TrackerProtocol::Http) => Ok(Arc::new(HttpTracker::new(url)?)),
        #[cfg(not(feature = "http-tracker"))]
        Some(TrackerProtocol::Http) => {
            Err(TorrentError::tracker_error_with_tracker("HTTP trackers are disabled in this build", url).into())
        }
        None => Err(TorrentError::tracker_error_with_tracker("Unsupported tracker protocol", url).into()),
    }
}

/// IPv6 peers of a `peers6` string: 16-byte address and 2-byte port each
pub fn parse_compact_peers6(data: &[u8]) -> Result<Vec<SocketAddr>> {
    const LEN: usize = 18;
    if data.len() % LEN != 0 {
        return Err(TorrentError::malformed(format!("Invalid compact peers6 data length {}", data.len())).into());
    }
    Ok(data
        .chunks_exact(LEN)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::from((octets, port))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_codes() {
        assert_eq!(TrackerEvent::None.udp_id(), 0);
        assert_eq!(TrackerEvent::Completed.udp_id(), 1);
        assert_eq!(TrackerEvent::Started.udp_id(), 2);
        assert_eq!(TrackerEvent::Stopped.udp_id(), 3);
        assert_eq!(TrackerEvent::None.as_str(), None);
        assert_eq!(TrackerEvent::Stopped.to_string(), "stopped");
        assert_eq!(TrackerEvent::None.to_string(), "empty");
    }

    #[test]
    fn test_protocol_from_url() {
        assert_eq!(TrackerProtocol::from_url("http://t.example/announce"), Some(TrackerProtocol::Http));
        assert_eq!(TrackerProtocol::from_url("HTTPS://t.example/announce"), Some(TrackerProtocol::Http));
        assert_eq!(TrackerProtocol::from_url("udp://t.example:6969"), Some(TrackerProtocol::Udp));
        assert_eq!(TrackerProtocol::from_url("wss://t.example"), None);
        assert_eq!(TrackerProtocol::from_url("not a url"), None);
    }

    #[test]
    fn test_open_transport_rejects_unknown_scheme() {
        let err = open_transport("ftp://t.example/announce").err().unwrap();
        assert!(matches!(crate::error::kind_of(&err), Some(TorrentError::TrackerError { .. })));
    }

    #[test]
    fn test_parse_compact_peers6() {
        let mut data = vec![0u8; 15];
        data.push(1);
        data.extend_from_slice(&6881u16.to_be_bytes());
        let peers = parse_compact_peers6(&data).unwrap();
        assert_eq!(peers, vec!["[::1]:6881".parse().unwrap()]);
        assert!(parse_compact_peers6(&data[..10]).is_err());
    }
}
