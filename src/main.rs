//! swarm-engine - Main entry point
//!
//! Joins one torrent (a .torrent file or a magnet link), discovers peers
//! over the DHT and trackers and keeps the swarm connections alive until
//! interrupted.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use swarm_engine::cli::Target;
use swarm_engine::torrent::build_torrent;
use swarm_engine::{
    CliArgs, Config, MagnetParser, PieceTracker, SwarmEngine, TorrentInfo, TorrentParser, TorrentSession,
};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("swarm-engine starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let engine = SwarmEngine::init(config.clone())
        .await
        .context("Failed to start the swarm engine")?;

    let session = match &config.target {
        Some(Target::Torrent(path)) => {
            let info = load_torrent_file(path)?;
            display_torrent_info(&info);
            let completion = Arc::new(PieceTracker::new(&info));
            engine.add_torrent(info, completion).await
        }
        Some(Target::Magnet(uri)) => {
            let magnet = MagnetParser::parse(uri).context("Failed to parse magnet link")?;
            info!("Joining {} from magnet link ({} trackers)", magnet.name(), magnet.trackers.len());
            engine.add_magnet(&magnet).await
        }
        None => {
            warn!("Nothing to join");
            engine.shutdown().await;
            return Ok(());
        }
    };

    if !session.has_metadata() {
        let session = Arc::clone(&session);
        let out = args.metadata_out.clone();
        tokio::spawn(async move {
            let info = session.wait_for_metadata().await;
            info!("Metadata resolved: {} ({} bytes)", info.name, info.total_size());
            session.set_completion(Arc::new(PieceTracker::new(&info)));
            if let Some(path) = out {
                if let Err(e) = save_metadata(&session, &info, &path) {
                    error!("Failed to save metadata to {}: {}", path.display(), e);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, leaving the swarm");

    match engine.status_json().await {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to render status: {}", e),
    }
    engine.shutdown().await;

    info!("swarm-engine finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
        debug!("Using pretty log format (verbose mode)");
    } else {
        subscriber.compact().init();
    }
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    let info = TorrentParser::parse_file(path).context("Failed to load torrent file")?;
    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

fn display_torrent_info(info: &TorrentInfo) {
    info!("Name: {}", info.name);
    info!("Info hash: {}", info.info_hash_hex());
    info!("Size: {} bytes in {} pieces of {} bytes", info.total_size(), info.piece_count(), info.piece_length);
    if info.is_multi_file() {
        for file in info.files_iter() {
            debug!("  {} ({} bytes)", file.path.join("/"), file.length);
        }
    }
    info!("Trackers: {}", info.announce_list.len());
    if info.private {
        info!("Private torrent: DHT and PEX disabled");
    }
}

/// Write a resolved magnet's metadata as a .torrent file
fn save_metadata(session: &TorrentSession, info: &TorrentInfo, path: &Path) -> Result<()> {
    let trackers = session.trackers();
    let bytes = build_torrent(trackers.first().map(String::as_str), &info.raw_info)?;
    std::fs::write(path, bytes)?;
    info!("Saved metadata to {}", path.display());
    Ok(())
}
