//! Per-torrent session
//!
//! The object every discovery channel resolves an info-hash to. It holds
//! the metainfo once known (assembled over ut_metadata for magnet links),
//! the transfer totals reported to trackers and the piece-completion
//! collaborator that owns the data path.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::protocol::metadata::{self, AssemblyProgress, MetadataAssembler};
use crate::torrent::info::{FileSpan, TorrentInfo};

/// Contract with the piece-selection and file-I/O subsystem
///
/// The swarm engine only needs to know when a piece completes, whether the
/// torrent is complete and how files are laid out. Block I/O defaults to a
/// data path that serves nothing and discards writes.
pub trait PieceCompletion: Send + Sync {
    fn on_piece_completed(&self, index: u32);

    fn is_complete(&self) -> bool;

    fn file_layout(&self) -> Vec<FileSpan>;

    /// Bitfield of verified pieces, if any are held
    fn bitfield(&self) -> Option<Vec<u8>> {
        None
    }

    /// Bytes still missing, when the collaborator tracks them
    fn bytes_left(&self) -> Option<u64> {
        None
    }

    fn read_block(&self, _index: u32, _begin: u32, _length: u32) -> Option<Vec<u8>> {
        None
    }

    fn write_block(&self, _index: u32, _begin: u32, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Completion for a torrent that is only being discovered
#[derive(Debug, Default)]
pub struct DiscoveryOnly;

impl PieceCompletion for DiscoveryOnly {
    fn on_piece_completed(&self, _index: u32) {}

    fn is_complete(&self) -> bool {
        false
    }

    fn file_layout(&self) -> Vec<FileSpan> {
        Vec::new()
    }
}

/// Completion backed by a flag per piece
#[derive(Debug)]
pub struct PieceTracker {
    done: Mutex<Vec<bool>>,
    piece_length: u64,
    total_size: u64,
    layout: Vec<FileSpan>,
}

impl PieceTracker {
    pub fn new(info: &TorrentInfo) -> Self {
        Self {
            done: Mutex::new(vec![false; info.piece_count()]),
            piece_length: info.piece_length,
            total_size: info.total_size(),
            layout: info.file_layout(),
        }
    }

    /// Tracker with every piece already verified
    pub fn seeded(info: &TorrentInfo) -> Self {
        let tracker = Self::new(info);
        if let Ok(mut done) = tracker.done.lock() {
            done.iter_mut().for_each(|d| *d = true);
        }
        tracker
    }

    pub fn completed(&self) -> usize {
        self.done.lock().map(|d| d.iter().filter(|&&p| p).count()).unwrap_or(0)
    }
}

impl PieceCompletion for PieceTracker {
    fn on_piece_completed(&self, index: u32) {
        if let Ok(mut done) = self.done.lock() {
            match done.get_mut(index as usize) {
                Some(piece) => *piece = true,
                None => warn!("Completed piece {} is out of range ({} pieces)", index, done.len()),
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.done.lock().map(|d| d.iter().all(|&p| p)).unwrap_or(false)
    }

    fn file_layout(&self) -> Vec<FileSpan> {
        self.layout.clone()
    }

    fn bitfield(&self) -> Option<Vec<u8>> {
        let done = self.done.lock().ok()?;
        if !done.iter().any(|&p| p) {
            return None;
        }
        let mut bits = vec![0u8; done.len().div_ceil(8)];
        for (i, _) in done.iter().enumerate().filter(|(_, &p)| p) {
            bits[i / 8] |= 0x80 >> (i % 8);
        }
        Some(bits)
    }

    fn bytes_left(&self) -> Option<u64> {
        let done = self.done.lock().ok()?;
        let mut left = 0;
        for (i, _) in done.iter().enumerate().filter(|(_, &p)| !p) {
            let start = i as u64 * self.piece_length;
            left += self.total_size.min(start + self.piece_length).saturating_sub(start);
        }
        Some(left)
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub info_hash: String,
    pub name: String,
    pub has_metadata: bool,
    pub complete: bool,
    pub total_size: Option<u64>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub trackers: usize,
    pub elapsed_secs: u64,
    pub failure: Option<String>,
}

/// One torrent, shared by every discovery channel
pub struct TorrentSession {
    info_hash: [u8; 20],
    name: RwLock<String>,
    info: RwLock<Option<Arc<TorrentInfo>>>,
    trackers: RwLock<Vec<String>>,
    assembler: Mutex<Option<MetadataAssembler>>,
    completion: RwLock<Arc<dyn PieceCompletion>>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    failure: Mutex<Option<String>>,
    metadata_ready: Notify,
    started: Instant,
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("name", &self.name())
            .field("has_metadata", &self.has_metadata())
            .finish()
    }
}

impl TorrentSession {
    pub fn new(
        info_hash: [u8; 20],
        name: impl Into<String>,
        info: Option<Arc<TorrentInfo>>,
        completion: Arc<dyn PieceCompletion>,
    ) -> Self {
        let trackers = info.as_ref().map(|i| i.announce_list.clone()).unwrap_or_default();
        Self {
            info_hash,
            name: RwLock::new(name.into()),
            info: RwLock::new(info),
            trackers: RwLock::new(trackers),
            assembler: Mutex::new(None),
            completion: RwLock::new(completion),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            failure: Mutex::new(None),
            metadata_ready: Notify::new(),
            started: Instant::now(),
        }
    }

    /// Session for a parsed `.torrent`
    pub fn from_info(info: TorrentInfo, completion: Arc<dyn PieceCompletion>) -> Self {
        let name = info.name.clone();
        Self::new(info.info_hash, name, Some(Arc::new(info)), completion)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn name(&self) -> String {
        self.name.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn info(&self) -> Option<Arc<TorrentInfo>> {
        self.info.read().ok().and_then(|i| i.clone())
    }

    pub fn has_metadata(&self) -> bool {
        self.info.read().is_ok_and(|i| i.is_some())
    }

    /// Private torrents are kept out of DHT and PEX
    pub fn is_private(&self) -> bool {
        self.info().is_some_and(|i| i.private)
    }

    pub fn metadata_size(&self) -> Option<usize> {
        self.info().map(|i| i.raw_info.len())
    }

    /// Slice `piece` of the info dictionary with the dictionary's size
    pub fn metadata_piece(&self, piece: u32) -> Option<(Vec<u8>, usize)> {
        let info = self.info()?;
        metadata::piece_of(&info.raw_info, piece).map(|data| (data.to_vec(), info.raw_info.len()))
    }

    /// Start assembling metadata of `size` bytes, unless already under way
    pub fn expect_metadata(&self, size: usize) -> Result<()> {
        if self.has_metadata() {
            return Ok(());
        }
        let mut assembler = self
            .assembler
            .lock()
            .map_err(|_| TorrentError::download_failure("Metadata state poisoned"))?;
        match assembler.as_ref() {
            Some(existing) if existing.size() == size => Ok(()),
            Some(existing) => Err(TorrentError::protocol_violation(format!(
                "Metadata size {} contradicts earlier size {}",
                size,
                existing.size()
            ))
            .into()),
            None => {
                debug!("Expecting {} bytes of metadata for {}", size, hex::encode(self.info_hash));
                *assembler = Some(MetadataAssembler::new(size)?);
                Ok(())
            }
        }
    }

    pub fn next_metadata_request(&self) -> Option<u32> {
        if self.has_metadata() {
            return None;
        }
        self.assembler.lock().ok()?.as_mut()?.next_request()
    }

    pub fn reject_metadata_piece(&self, piece: u32) {
        if let Ok(mut assembler) = self.assembler.lock() {
            if let Some(assembler) = assembler.as_mut() {
                assembler.reject(piece);
            }
        }
    }

    /// Store one metadata piece; a verified dictionary becomes the session's info
    pub fn add_metadata_piece(&self, piece: u32, data: &[u8]) -> Result<AssemblyProgress> {
        let mut assembler = self
            .assembler
            .lock()
            .map_err(|_| TorrentError::download_failure("Metadata state poisoned"))?;
        let Some(pending) = assembler.as_mut() else {
            return Ok(AssemblyProgress::Pending);
        };

        let progress = pending.add(piece, data, &self.info_hash)?;
        if let AssemblyProgress::Complete(raw_info) = &progress {
            *assembler = None;
            let info = TorrentInfo::from_info_bytes(raw_info, self.trackers())?;
            self.set_info(info);
        }
        Ok(progress)
    }

    /// Install metainfo and wake anyone waiting for it
    pub fn set_info(&self, info: TorrentInfo) {
        if info.info_hash != self.info_hash {
            warn!("Ignoring metainfo for {} on session {}", info.info_hash_hex(), hex::encode(self.info_hash));
            return;
        }
        info!("Metadata ready for {} ({})", info.name, info.info_hash_hex());
        self.add_trackers(&info.announce_list);
        if let Ok(mut name) = self.name.write() {
            *name = info.name.clone();
        }
        if let Ok(mut slot) = self.info.write() {
            *slot = Some(Arc::new(info));
        }
        self.metadata_ready.notify_waiters();
    }

    /// Wait until metadata is known
    pub async fn wait_for_metadata(&self) -> Arc<TorrentInfo> {
        loop {
            let notified = self.metadata_ready.notified();
            if let Some(info) = self.info() {
                return info;
            }
            notified.await;
        }
    }

    pub fn completion(&self) -> Arc<dyn PieceCompletion> {
        match self.completion.read() {
            Ok(completion) => Arc::clone(&completion),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn set_completion(&self, completion: Arc<dyn PieceCompletion>) {
        if let Ok(mut slot) = self.completion.write() {
            *slot = completion;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.has_metadata() && self.completion().is_complete()
    }

    pub fn trackers(&self) -> Vec<String> {
        self.trackers.read().map(|t| t.clone()).unwrap_or_default()
    }

    /// Add announce URLs not already known
    pub fn add_trackers(&self, urls: &[String]) {
        if let Ok(mut trackers) = self.trackers.write() {
            for url in urls {
                if !url.is_empty() && !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Bytes left, as reported to trackers
    pub fn left(&self) -> u64 {
        if self.is_complete() {
            return 0;
        }
        self.completion()
            .bytes_left()
            .or_else(|| self.info().map(|i| i.total_size().saturating_sub(self.downloaded())))
            .unwrap_or(0)
    }

    /// Record that discovery failed; `None` clears it
    pub fn set_failure(&self, failure: Option<String>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    pub fn stats(&self) -> SessionStats {
        let info = self.info();
        SessionStats {
            info_hash: hex::encode(self.info_hash),
            name: self.name(),
            has_metadata: info.is_some(),
            complete: self.is_complete(),
            total_size: info.map(|i| i.total_size()),
            uploaded: self.uploaded(),
            downloaded: self.downloaded(),
            left: self.left(),
            trackers: self.trackers().len(),
            elapsed_secs: self.started.elapsed().as_secs(),
            failure: self.failure(),
        }
    }

    /// Stats as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.stats())?)
    }
}
