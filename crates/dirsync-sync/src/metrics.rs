//! Run metrics
//!
//! Tasks report what happens to each file through the [`SyncListener`]
//! hooks. [`SyncMetrics`] is the listener used by the orchestrator: atomic
//! totals updated concurrently by every worker, a ring of the most recent
//! upload starts and the first failed files.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

/// Recent upload starts kept for the summary
pub const MAX_RECENT_ACTIVITIES: usize = 100;

/// Failed file paths kept for the summary
pub const MAX_FAILED_FILES: usize = 100;

/// Observer of per-file outcomes
///
/// Every hook has an empty default so listeners implement only what they
/// need. Hooks are called from many workers at once.
pub trait SyncListener: Send + Sync {
    /// An upload of `file` is starting
    fn started(&self, _file: &Path) {}

    /// `delta` bytes were transferred; negative when progress is rolled back
    fn progressed(&self, _delta: i64) {}

    fn completed(&self, _file: &Path, _asset_id: &str) {}

    /// `file` was already current remotely
    fn skipped(&self, _file: &Path) {}

    fn failed(&self, _file: &Path, _reason: &str) {}

    fn downloaded(&self, _file: &Path) {}

    fn destroyed(&self, _asset_path: &str) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SyncListener for NoopListener {}

/// An upload start recorded for the summary
#[derive(Debug, Clone)]
pub struct Activity {
    pub at: DateTime<Local>,
    pub file: PathBuf,
}

/// Point-in-time copy of the run metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uploaded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub uploaded_bytes: i64,
    pub downloaded: u64,
    pub destroyed: u64,
    /// Newest first
    pub recent_activities: Vec<Activity>,
    /// At most [`MAX_FAILED_FILES`] entries; `failed` holds the full count
    pub failed_files: Vec<PathBuf>,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn processed(&self) -> u64 {
        self.uploaded + self.failed + self.skipped
    }

    /// True when more files failed than are listed
    pub fn failed_files_truncated(&self) -> bool {
        self.failed > self.failed_files.len() as u64
    }
}

/// Thread-safe run metrics
#[derive(Debug)]
pub struct SyncMetrics {
    started_at: Instant,
    uploaded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    uploaded_bytes: AtomicI64,
    downloaded: AtomicU64,
    destroyed: AtomicU64,
    recent: Mutex<VecDeque<Activity>>,
    failed_files: Mutex<Vec<PathBuf>>,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            uploaded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            uploaded_bytes: AtomicI64::new(0),
            downloaded: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ACTIVITIES)),
            failed_files: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let recent_activities = self
            .recent
            .lock()
            .map(|r| r.iter().rev().cloned().collect())
            .unwrap_or_default();
        let failed_files = self
            .failed_files
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            recent_activities,
            failed_files,
            elapsed: self.elapsed(),
        }
    }
}

impl SyncListener for SyncMetrics {
    fn started(&self, file: &Path) {
        debug!(path = %file.display(), "Uploading");
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == MAX_RECENT_ACTIVITIES {
                recent.pop_front();
            }
            recent.push_back(Activity {
                at: Local::now(),
                file: file.to_path_buf(),
            });
        }
    }

    fn progressed(&self, delta: i64) {
        self.uploaded_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    fn completed(&self, file: &Path, asset_id: &str) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
        info!(path = %file.display(), asset_id, "Uploaded");
    }

    fn skipped(&self, file: &Path) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(path = %file.display(), "Skipped, already up to date");
    }

    fn failed(&self, file: &Path, reason: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(path = %file.display(), reason, "Failed to upload");
        if let Ok(mut failed) = self.failed_files.lock() {
            if failed.len() < MAX_FAILED_FILES {
                failed.push(file.to_path_buf());
            }
        }
    }

    fn downloaded(&self, file: &Path) {
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        info!(path = %file.display(), "Downloaded");
    }

    fn destroyed(&self, asset_path: &str) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        info!(asset_path, "Destroyed remote asset");
    }
}
