//! Error types for the swarm engine
//!
//! This module defines the error taxonomy shared by every protocol layer:
//! encoding, peer wire, DHT, trackers and torrent sessions.

use std::fmt;

/// Error type for swarm operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bad bencode: the message is dropped and the sender is not penalised
    /// beyond a failed-query counter
    MalformedEncoding {
        message: String,
        source: Option<String>,
    },

    /// Bad handshake or frame: the connection is closed immediately
    ProtocolViolation {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// A DHT or tracker request went unanswered
    Timeout {
        operation: String,
        target: Option<String>,
    },

    /// Unknown extension sub-type, never fatal
    UnsupportedExtension {
        extension: String,
    },

    /// Every discovery channel of a torrent is exhausted
    DownloadFailure {
        message: String,
        info_hash: Option<String>,
    },

    /// Metainfo or magnet link parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Tracker replied with a failure or an unreadable response
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// DHT (Distributed Hash Table) errors
    DHTError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },
}

impl TorrentError {
    /// Create a new MalformedEncoding error
    pub fn malformed(message: impl Into<String>) -> Self {
        TorrentError::MalformedEncoding {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new MalformedEncoding error with source
    pub fn malformed_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::MalformedEncoding {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new ProtocolViolation attributed to a peer
    pub fn protocol_violation_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new Timeout
    pub fn timeout(operation: impl Into<String>) -> Self {
        TorrentError::Timeout {
            operation: operation.into(),
            target: None,
        }
    }

    /// Create a new Timeout naming the unresponsive target
    pub fn timeout_with_target(operation: impl Into<String>, target: impl Into<String>) -> Self {
        TorrentError::Timeout {
            operation: operation.into(),
            target: Some(target.into()),
        }
    }

    /// Create a new UnsupportedExtension
    pub fn unsupported_extension(extension: impl Into<String>) -> Self {
        TorrentError::UnsupportedExtension {
            extension: extension.into(),
        }
    }

    /// Create a new DownloadFailure
    pub fn download_failure(message: impl Into<String>) -> Self {
        TorrentError::DownloadFailure {
            message: message.into(),
            info_hash: None,
        }
    }

    /// Create a new DownloadFailure for a torrent
    pub fn download_failure_for(message: impl Into<String>, info_hash: impl Into<String>) -> Self {
        TorrentError::DownloadFailure {
            message: message.into(),
            info_hash: Some(info_hash.into()),
        }
    }

    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: None,
            source: None,
        }
    }

    /// Create a new TrackerError with the tracker URL
    pub fn tracker_error_with_tracker(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with tracker and source
    pub fn tracker_error_full(
        message: impl Into<String>,
        tracker: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DHTError
    pub fn dht_error(message: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DHTError with node address
    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    /// Create a new DHTError with node and source
    pub fn dht_error_full(message: impl Into<String>, node: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Whether the failure is recovered locally instead of being surfaced
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            TorrentError::Timeout { .. }
                | TorrentError::MalformedEncoding { .. }
                | TorrentError::UnsupportedExtension { .. }
        )
    }

    /// Whether the failure should close the peer connection
    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(self, TorrentError::ProtocolViolation { .. })
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::MalformedEncoding { source, .. }
            | TorrentError::ProtocolViolation { source, .. }
            | TorrentError::ParseError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::DHTError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::MalformedEncoding { message, source } => {
                if let Some(src) = source {
                    write!(f, "Malformed encoding: {} (source: {})", message, src)
                } else {
                    write!(f, "Malformed encoding: {}", message)
                }
            }
            TorrentError::ProtocolViolation { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Protocol violation: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Protocol violation: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Protocol violation: {} (source: {})", message, s),
                    (None, None) => write!(f, "Protocol violation: {}", message),
                }
            }
            TorrentError::Timeout { operation, target } => {
                if let Some(t) = target {
                    write!(f, "Timeout: {} (target: {})", operation, t)
                } else {
                    write!(f, "Timeout: {}", operation)
                }
            }
            TorrentError::UnsupportedExtension { extension } => {
                write!(f, "Unsupported extension: {}", extension)
            }
            TorrentError::DownloadFailure { message, info_hash } => {
                if let Some(hash) = info_hash {
                    write!(f, "Download failure: {} (info hash: {})", message, hash)
                } else {
                    write!(f, "Download failure: {}", message)
                }
            }
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::TrackerError { message, tracker, source } => {
                match (tracker, source) {
                    (Some(t), Some(s)) => write!(f, "Tracker error: {} (tracker: {}, source: {})", message, t, s),
                    (Some(t), None) => write!(f, "Tracker error: {} (tracker: {})", message, t),
                    (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker error: {}", message),
                }
            }
            TorrentError::DHTError { message, node, source } => {
                match (node, source) {
                    (Some(n), Some(s)) => write!(f, "DHT error: {} (node: {}, source: {})", message, n, s),
                    (Some(n), None) => write!(f, "DHT error: {} (node: {})", message, n),
                    (None, Some(s)) => write!(f, "DHT error: {} (source: {})", message, s),
                    (None, None) => write!(f, "DHT error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::NetworkError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::timeout("Operation timed out")
    }
}

/// Returns the swarm error carried by an `anyhow::Error`, if any
pub fn kind_of(err: &anyhow::Error) -> Option<&TorrentError> {
    err.downcast_ref::<TorrentError>()
}
