//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::protocol::EncryptionMode;

/// CLI arguments for the swarm engine
#[derive(Debug, Parser)]
#[command(name = "swarm-engine")]
#[command(about = "A BitTorrent swarm engine: DHT, peer wire and tracker discovery", long_about = None)]
pub struct CliArgs {
    /// Path to a .torrent file or a magnet link
    #[arg(value_name = "TORRENT_OR_MAGNET")]
    pub target: String,

    /// Listening port for incoming peer connections
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// UDP port of the DHT node
    #[arg(long, default_value_t = 6881)]
    pub dht_port: u16,

    /// Upload slots per torrent
    #[arg(long, default_value_t = crate::peer::DEFAULT_UPLOAD_SLOTS)]
    pub max_upload_slots: usize,

    /// Maximum number of peer connections per torrent
    #[arg(short, long, default_value_t = 50)]
    pub max_peers: usize,

    /// Disable DHT peer discovery
    #[arg(long)]
    pub no_dht: bool,

    /// Disable local service discovery (LAN multicast)
    #[arg(long)]
    pub no_lsd: bool,

    /// Disable tracker announces
    #[arg(long)]
    pub no_tracker: bool,

    /// Connection encryption policy
    #[arg(long, value_enum, default_value_t = EncryptionMode::PreferPlaintext)]
    pub encryption: EncryptionMode,

    /// Upload limit in KiB/s (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub upload_limit: u64,

    /// Download limit in KiB/s (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub download_limit: u64,

    /// Trackers announced to per torrent
    #[arg(long, default_value_t = crate::tracker::DEFAULT_TRACKER_SIZE)]
    pub tracker_size: usize,

    /// DHT bootstrap node as host:port (repeatable; defaults to the public routers)
    #[arg(long = "bootstrap", value_name = "HOST:PORT")]
    pub bootstrap: Vec<String>,

    /// Extra announce URL added to the tracker pool (repeatable)
    #[arg(long = "tracker", value_name = "URL")]
    pub trackers: Vec<String>,

    /// Write the .torrent resolved from a magnet link to this path
    #[arg(long, value_name = "PATH")]
    pub metadata_out: Option<PathBuf>,

    /// Seconds between status reports (0 = never)
    #[arg(long, default_value_t = 30)]
    pub status_interval: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
