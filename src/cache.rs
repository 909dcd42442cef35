//! # Transcript Cache
//!
//! Disk-backed map from [`VideoId`] to a finished transcript. Each entry is a
//! single `<id>.txt` file; the file's modification time is the entry's
//! last-write timestamp and its length is the entry's size.
//!
//! ## Guarantees:
//! - `get` only returns entries younger than the TTL; stale files are removed on sight
//! - `put` writes to a temporary file and renames it, so readers never see half an entry
//! - `sweep` drops expired entries, then evicts oldest-first until under the byte budget
//!
//! ## Failure policy:
//! The cache is an optimization. Any I/O failure is logged and treated as a
//! miss (or a skipped write); it never fails a request.

use crate::config::CacheConfig;
use crate::locator::VideoId;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "txt";

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
}

/// Point-in-time view of the cache for the health endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

/// One file found while scanning the cache directory.
#[derive(Debug)]
struct EntryFile {
    path: PathBuf,
    written_at: SystemTime,
    size: u64,
}

/// Disk-backed transcript cache shared by every job.
pub struct TranscriptCache {
    dir: PathBuf,
    ttl: Duration,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl TranscriptCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.dir.clone(), config.ttl(), config.max_bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &VideoId) -> PathBuf {
        self.dir.join(format!("{}.{}", id.as_str(), ENTRY_EXTENSION))
    }

    fn is_expired(&self, written_at: SystemTime, now: SystemTime) -> bool {
        // A timestamp in the future (clock skew) counts as fresh.
        now.duration_since(written_at).map(|age| age > self.ttl).unwrap_or(false)
    }

    /// Look up a transcript. Missing, stale or unreadable entries are all `None`.
    pub async fn get(&self, id: &VideoId) -> Option<String> {
        let path = self.entry_path(id);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(video_id = %id, error = %e, "Cache metadata read failed");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let written_at = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if self.is_expired(written_at, SystemTime::now()) {
            debug!(video_id = %id, "Cache entry expired, removing");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(video_id = %id, error = %e, "Failed to remove stale cache entry");
                }
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(text)
            }
            Err(e) => {
                // Racing a sweep that just removed the file is expected.
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(video_id = %id, error = %e, "Cache read failed");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a transcript, replacing any previous entry for the same id.
    pub async fn put(&self, id: &VideoId, text: &str) {
        if let Err(e) = self.write_entry(id, text).await {
            warn!(video_id = %id, error = %e, "Cache write failed, continuing without caching");
            return;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(video_id = %id, bytes = text.len(), "Cached transcript");
    }

    async fn write_entry(&self, id: &VideoId, text: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let final_path = self.entry_path(id);
        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", id.as_str(), uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp_path, text.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }

    /// Scan the directory for entry files. Temp files and foreign files are skipped.
    async fn scan(&self) -> std::io::Result<Vec<EntryFile>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_entry = path.extension().map(|ext| ext == ENTRY_EXTENSION).unwrap_or(false)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_entry {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            entries.push(EntryFile {
                path,
                written_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: metadata.len(),
            });
        }

        Ok(entries)
    }

    /// Remove expired entries, then enforce the byte budget oldest-first.
    ///
    /// ## Concurrency:
    /// Runs alongside request handling. A `get` racing an eviction simply
    /// observes a miss; files that vanish mid-sweep are ignored.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match self.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cache sweep could not read directory");
                return report;
            }
        };

        let now = SystemTime::now();
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.is_expired(entry.written_at, now) {
                if remove_quietly(&entry.path).await {
                    report.expired += 1;
                }
            } else {
                live.push(entry);
            }
        }

        live.sort_by_key(|entry| entry.written_at);
        let mut total: u64 = live.iter().map(|entry| entry.size).sum();
        let mut survivors = live.len();

        for entry in &live {
            if total <= self.max_bytes {
                break;
            }
            if remove_quietly(&entry.path).await {
                report.evicted += 1;
            }
            total = total.saturating_sub(entry.size);
            survivors -= 1;
        }

        report.remaining_entries = survivors;
        report.remaining_bytes = total;

        if report.expired > 0 || report.evicted > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining_bytes = report.remaining_bytes,
                "Cache sweep removed entries"
            );
        }
        report
    }

    pub async fn stats(&self) -> CacheStats {
        let (entries, bytes) = match self.scan().await {
            Ok(files) => (files.len(), files.iter().map(|f| f.size).sum()),
            Err(_) => (0, 0),
        };
        CacheStats {
            entries,
            bytes,
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove cache entry");
            false
        }
    }
}

/// Run `sweep` every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    cache: Arc<TranscriptCache>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    cache.sweep().await;
                }
            }
        }
        debug!("Cache sweeper stopped");
    })
}
