//! CLI configuration module
//!
//! Validated engine configuration built from the CLI arguments.

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::peer::DEFAULT_UPLOAD_SLOTS;
use crate::protocol::EncryptionMode;
use crate::torrent::MagnetParser;
use crate::tracker::DEFAULT_TRACKER_SIZE;
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// What to join
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Torrent(PathBuf),
    Magnet(String),
}

impl Target {
    pub fn parse(input: &str) -> Self {
        if MagnetParser::is_magnet_link(input) {
            Target::Magnet(input.to_string())
        } else {
            Target::Torrent(PathBuf::from(input))
        }
    }
}

/// Configuration for the swarm engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Torrent to join at startup
    pub target: Option<Target>,
    /// TCP listening port, 0 picks an ephemeral port
    pub port: u16,
    /// DHT UDP port, 0 picks an ephemeral port
    pub dht_port: u16,
    /// Upload slots per torrent
    pub max_upload_slots: usize,
    /// Peer connections per torrent
    pub max_peers: usize,
    pub use_dht: bool,
    pub use_tracker: bool,
    pub use_lsd: bool,
    pub encryption: EncryptionMode,
    /// Bytes per second, 0 = unlimited
    pub upload_limit: u64,
    /// Bytes per second, 0 = unlimited
    pub download_limit: u64,
    /// Trackers announced to per torrent
    pub tracker_size: usize,
    /// DHT routers; empty means the public defaults
    pub bootstrap_nodes: Vec<String>,
    /// Announce URLs seeding the shared tracker pool
    pub trackers: Vec<String>,
    /// Period of the status report, `None` disables it
    pub status_interval: Option<Duration>,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            port: 6881,
            dht_port: 6881,
            max_upload_slots: DEFAULT_UPLOAD_SLOTS,
            max_peers: 50,
            use_dht: true,
            use_tracker: true,
            use_lsd: true,
            encryption: EncryptionMode::default(),
            upload_limit: 0,
            download_limit: 0,
            tracker_size: DEFAULT_TRACKER_SIZE,
            bootstrap_nodes: Vec::new(),
            trackers: Vec::new(),
            status_interval: Some(Duration::from_secs(30)),
            verbose: false,
            quiet: false,
        }
    }
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            target: Some(Target::parse(&args.target)),
            port: args.port,
            dht_port: args.dht_port,
            max_upload_slots: args.max_upload_slots,
            max_peers: args.max_peers,
            use_dht: !args.no_dht,
            use_tracker: !args.no_tracker,
            use_lsd: !args.no_lsd,
            encryption: args.encryption,
            upload_limit: args.upload_limit * 1024,
            download_limit: args.download_limit * 1024,
            tracker_size: args.tracker_size,
            bootstrap_nodes: args.bootstrap.clone(),
            trackers: args.trackers.clone(),
            status_interval: (args.status_interval > 0).then(|| Duration::from_secs(args.status_interval)),
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate a user-supplied configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.use_dht && self.dht_port == 0 {
            return Err(TorrentError::config_error_with_field("DHT port cannot be 0", "dht_port").into());
        }
        if self.max_upload_slots == 0 {
            return Err(TorrentError::config_error_with_field("At least one upload slot is required", "max_upload_slots").into());
        }
        if self.max_peers == 0 {
            return Err(TorrentError::config_error_with_field("max_peers must be at least 1", "max_peers").into());
        }
        if self.use_tracker && self.tracker_size == 0 {
            return Err(TorrentError::config_error_with_field("tracker_size must be at least 1", "tracker_size").into());
        }
        for node in &self.bootstrap_nodes {
            if !is_host_port(node) {
                return Err(TorrentError::config_error_with_field(format!("Bad bootstrap node '{}'", node), "bootstrap").into());
            }
        }
        if let Some(Target::Torrent(path)) = &self.target {
            if !path.is_file() {
                return Err(TorrentError::config_error_with_field(
                    format!("Cannot read torrent file {}", path.display()),
                    "target",
                )
                .into());
            }
        }
        Ok(())
    }

    /// Get the listen address for incoming connections
    pub fn get_listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn get_dht_addr(&self) -> String {
        format!("0.0.0.0:{}", self.dht_port)
    }

    pub fn is_dht_enabled(&self) -> bool {
        self.use_dht
    }

    pub fn is_tracker_enabled(&self) -> bool {
        self.use_tracker
    }
}

/// `host:port` with a non-empty host and a non-zero port
fn is_host_port(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => {
            !host.trim_matches(|c| c == '[' || c == ']').is_empty() && port.parse::<u16>().map_or(false, |p| p != 0)
        }
        None => false,
    }
}
