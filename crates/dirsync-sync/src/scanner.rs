//! Tree scanner, checker pool and the producer loop
//!
//! ```text
//!             ┌──────────── namespace.create ─────────────┐
//!             │                                           ▼
//! TreeScanner ─► batch buffer ─(batch size)─► CheckerPool ─► TaskQueue
//!                                                 │
//!                             saturated: the producer checks the batch itself
//! ```
//!
//! [`SyncProducer`] repeats the scan in daemon mode:
//!
//! ```text
//! Scanning ──► IdleWait(interval) ──pending work?──► IdleWait(interval)
//!    ▲                 │ idle                                │
//!    └─────────────────┴─────────────────────────────────────┘
//! ```
//!
//! A one-shot run ends by putting one poison task per consumer on the queue
//! once every checker has finished.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dirsync_core::domain::{Job, JobType};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::remote_scan;
use crate::task::{CheckItem, Task, TaskContext};

// ============================================================================
// Checker pool
// ============================================================================

/// Bounded pool running batch checks
///
/// At most `size` batches are checked concurrently; when every checker is
/// busy the submitting producer runs the check inline, which throttles
/// the walk.
pub struct CheckerPool {
    ctx: TaskContext,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckerPool {
    pub fn new(ctx: TaskContext, size: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(size.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Batches being checked right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn submit(&self, items: Vec<CheckItem>) {
        if items.is_empty() {
            return;
        }
        let task = Task::batch_check(items);
        self.active.fetch_add(1, Ordering::SeqCst);

        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let ctx = self.ctx.clone();
                let active = Arc::clone(&self.active);
                let handle = tokio::spawn(async move {
                    run_check(task, &ctx).await;
                    drop(permit);
                    active.fetch_sub(1, Ordering::SeqCst);
                });
                if let Ok(mut handles) = self.handles.lock() {
                    handles.retain(|h| !h.is_finished());
                    handles.push(handle);
                }
            }
            Err(_) => {
                debug!("All checkers busy, checking batch on the producer");
                run_check(task, &self.ctx).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Waits for every submitted batch to finish
    pub async fn wait_idle(&self) {
        let handles = self
            .handles
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Checker panicked");
            }
        }
    }
}

async fn run_check(mut task: Task, ctx: &TaskContext) {
    if let Err(e) = task.execute(ctx).await {
        if e.is_cancelled() {
            debug!(task_id = %task.id(), "Batch check cancelled");
        } else {
            error!(task_id = %task.id(), error = %e, "Batch check failed");
        }
    }
}

// ============================================================================
// Tree scanner
// ============================================================================

/// Where discovered files go
enum Sink {
    /// Batched through the checker pool
    Checked(Arc<CheckerPool>),
    /// Straight onto the queue as uploads
    Direct,
}

/// What one scan found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub directories: usize,
    pub files: usize,
}

/// Walks the upload jobs of a settings instance
pub struct TreeScanner {
    ctx: TaskContext,
    sink: Sink,
    batch: Mutex<Vec<CheckItem>>,
}

impl TreeScanner {
    /// Scanner feeding batches to `checkers`
    pub fn checked(ctx: TaskContext, checkers: Arc<CheckerPool>) -> Self {
        Self {
            ctx,
            sink: Sink::Checked(checkers),
            batch: Mutex::new(Vec::new()),
        }
    }

    /// Scanner queueing every file as an upload, for freshly created trees
    pub fn direct(ctx: TaskContext) -> Self {
        Self {
            ctx,
            sink: Sink::Direct,
            batch: Mutex::new(Vec::new()),
        }
    }

    /// Files waiting for the batch to fill up
    pub fn pending_batch(&self) -> usize {
        self.batch.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Walks every upload job once
    pub async fn scan(&self) -> ScanStats {
        let mut stats = ScanStats::default();
        let settings = Arc::clone(&self.ctx.settings);
        for job in settings.jobs_of_type(JobType::Upload) {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            info!(directory = %job.directory().display(), namespace = %job.namespace(), "Scanning");
            self.walk(job, job.directory().to_path_buf(), &mut stats)
                .await;
            self.flush().await;
        }
        stats
    }

    fn walk<'a>(
        &'a self,
        job: &'a Job,
        dir: PathBuf,
        stats: &'a mut ScanStats,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.ctx.cancel.is_cancelled() {
                return;
            }
            stats.directories += 1;
            if !self.ctx.settings.exclude_empty_folder() && job.matches(&dir) {
                match job.remote_path_for(&dir) {
                    Ok(namespace) => self.ctx.queue.put(Task::namespace_create(namespace)),
                    Err(e) => warn!(path = %dir.display(), error = %e, "Cannot map directory"),
                }
            }

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to read directory");
                    return;
                }
            };
            let mut children = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => children.push(entry),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Failed to list directory");
                        break;
                    }
                }
            }
            children.sort_by_key(|entry| entry.file_name());

            for entry in children {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to stat entry");
                        continue;
                    }
                };
                if file_type.is_dir() {
                    self.walk(job, path, stats).await;
                } else if file_type.is_file() {
                    if self.visit_file(job, path).await {
                        stats.files += 1;
                    }
                } else {
                    debug!(path = %path.display(), "Skipping non-regular file");
                }
            }
        })
    }

    /// Hands a file to the sink; returns false if it was filtered out
    async fn visit_file(&self, job: &Job, path: PathBuf) -> bool {
        if self.ctx.settings.is_log_file(&path) {
            debug!(path = %path.display(), "Skipping own log file");
            return false;
        }
        if !job.matches(&path) {
            return false;
        }
        let asset_path = match job.remote_path_for(&path) {
            Ok(asset_path) => asset_path,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot map file");
                return false;
            }
        };

        match &self.sink {
            Sink::Direct => self.ctx.queue.put(Task::upload(path, asset_path)),
            Sink::Checked(checkers) => {
                let full = self.batch.lock().ok().and_then(|mut batch| {
                    batch.push(CheckItem::new(path, asset_path));
                    (batch.len() >= self.ctx.settings.check_batch_size())
                        .then(|| std::mem::take(&mut *batch))
                });
                if let Some(items) = full {
                    checkers.submit(items).await;
                }
            }
        }
        true
    }

    /// Submits the partially filled batch
    pub async fn flush(&self) {
        let Sink::Checked(checkers) = &self.sink else {
            return;
        };
        let items = self
            .batch
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();
        checkers.submit(items).await;
    }
}

// ============================================================================
// Producer loop
// ============================================================================

/// Drives scans for a run: once, or forever in daemon mode
pub struct SyncProducer {
    ctx: TaskContext,
    scanner: TreeScanner,
    checkers: Arc<CheckerPool>,
    consumers: usize,
}

impl SyncProducer {
    pub fn new(ctx: TaskContext, consumers: usize) -> Self {
        let checkers = Arc::new(CheckerPool::new(
            ctx.clone(),
            ctx.settings.max_checkers(),
        ));
        Self {
            scanner: TreeScanner::checked(ctx.clone(), Arc::clone(&checkers)),
            ctx,
            checkers,
            consumers,
        }
    }

    /// Work queued, batched or being checked
    pub fn has_pending_work(&self) -> bool {
        !self.ctx.queue.is_empty()
            || self.scanner.pending_batch() > 0
            || self.checkers.active() > 0
    }

    pub async fn run(&self) {
        loop {
            self.scan_once().await;
            if self.ctx.cancel.is_cancelled() {
                break;
            }

            if !self.ctx.settings.daemon() {
                self.checkers.wait_idle().await;
                for _ in 0..self.consumers {
                    self.ctx.queue.put(Task::poison());
                }
                info!(consumers = self.consumers, "Scan complete, stopping consumers");
                return;
            }

            let interval = self.ctx.settings.daemon_scan_interval();
            if !self.pause(interval).await {
                break;
            }
            while self.has_pending_work() {
                info!(
                    queued = self.ctx.queue.len(),
                    wait_secs = interval.as_secs(),
                    "Task queue is not empty, delaying next scan"
                );
                if !self.pause(interval).await {
                    return;
                }
            }
        }
        debug!("Producer stopped");
    }

    async fn scan_once(&self) {
        info!("Scanning source files");
        let stats = self.scanner.scan().await;
        debug!(
            directories = stats.directories,
            files = stats.files,
            "Tree scan finished"
        );

        for job in self.ctx.settings.jobs_of_type(JobType::Download) {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            match remote_scan::scan_download_job(&self.ctx, job).await {
                Ok(count) => info!(namespace = %job.namespace(), scheduled = count, "Remote scan finished"),
                Err(e) => error!(namespace = %job.namespace(), error = %e, "Remote scan failed"),
            }
        }
    }

    /// Sleeps for `interval`; false if cancelled first
    async fn pause(&self, interval: Duration) -> bool {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::*;
    use crate::task::TaskKind;

    use dirsync_core::domain::Settings;
    use dirsync_remote::InMemoryStore;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("b/c")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("b/c.txt"), b"").unwrap();
        std::fs::write(dir.path().join("b/c/skip.tmp"), b"x").unwrap();
        dir
    }

    fn settings(dir: &TempDir, excludes: &[&str]) -> Settings {
        let mut settings = Settings::new();
        settings.add_job(
            Job::new(
                JobType::Upload,
                dir.path(),
                rp("/ns/root"),
                false,
                Vec::<&str>::new(),
                excludes.to_vec(),
            )
            .unwrap(),
        );
        settings
    }

    fn namespaces(tasks: &[Task]) -> Vec<String> {
        tasks
            .iter()
            .filter_map(|t| match t.kind() {
                TaskKind::NamespaceCreate(n) => Some(n.namespace().to_string()),
                _ => None,
            })
            .collect()
    }

    fn uploads(tasks: &[Task]) -> Vec<String> {
        let mut paths: Vec<String> = tasks
            .iter()
            .filter_map(|t| match t.kind() {
                TaskKind::Upload(u) => Some(u.asset_path().to_string()),
                _ => None,
            })
            .collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_direct_scan_queues_namespaces_and_uploads() {
        let dir = tree();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, settings(&dir, &["**/*.tmp"]));

        let stats = TreeScanner::direct(ctx.clone()).scan().await;
        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 3);

        let tasks = drain(&ctx.queue);
        assert_eq!(namespaces(&tasks), vec!["/ns/root", "/ns/root/b", "/ns/root/b/c"]);
        assert_eq!(uploads(&tasks), vec!["/ns/root/a.txt", "/ns/root/b/c.txt"]);
    }

    #[tokio::test]
    async fn test_exclude_empty_folder_suppresses_namespaces() {
        let dir = tree();
        let store = Arc::new(InMemoryStore::new());
        let mut settings = settings(&dir, &[]);
        settings.set_exclude_empty_folder(true);
        let (ctx, _) = context(&store, settings);

        TreeScanner::direct(ctx.clone()).scan().await;
        let tasks = drain(&ctx.queue);
        assert!(namespaces(&tasks).is_empty());
        assert_eq!(uploads(&tasks).len(), 3);
    }

    #[tokio::test]
    async fn test_log_files_are_never_scanned() {
        let dir = tree();
        std::fs::write(dir.path().join("dirsync.0.log"), b"log").unwrap();
        let store = Arc::new(InMemoryStore::new());
        let mut settings = settings(&dir, &["**/*.tmp"]);
        settings.set_log_directory(Some(dir.path().to_path_buf()));
        let (ctx, _) = context(&store, settings);

        TreeScanner::direct(ctx.clone()).scan().await;
        let tasks = drain(&ctx.queue);
        assert_eq!(uploads(&tasks), vec!["/ns/root/a.txt", "/ns/root/b/c.txt"]);
    }

    #[tokio::test]
    async fn test_checked_scan_batches_files() {
        let dir = TempDir::new().unwrap();
        for i in 0..7 {
            std::fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }
        let store = Arc::new(InMemoryStore::new());
        let mut settings = settings(&dir, &[]);
        settings.set_check_batch_size(3);
        let (ctx, _) = context(&store, settings);
        let checkers = Arc::new(CheckerPool::new(ctx.clone(), 2));

        let scanner = TreeScanner::checked(ctx.clone(), Arc::clone(&checkers));
        scanner.scan().await;
        checkers.wait_idle().await;

        assert_eq!(scanner.pending_batch(), 0);
        assert_eq!(checkers.active(), 0);
        assert_eq!(store.calls_to("asset.exists"), 3);
        assert_eq!(uploads(&drain(&ctx.queue)).len(), 7);
    }

    #[tokio::test]
    async fn test_one_shot_producer_ends_with_poison_per_consumer() {
        let dir = tree();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, settings(&dir, &[]));

        let producer = SyncProducer::new(ctx.clone(), 3);
        tokio::time::timeout(Duration::from_secs(5), producer.run())
            .await
            .unwrap();

        let tasks = drain(&ctx.queue);
        let poison = tasks.iter().filter(|t| t.is_poison()).count();
        assert_eq!(poison, 3);
        assert!(tasks.iter().rev().take(3).all(Task::is_poison));
    }

    #[tokio::test]
    async fn test_daemon_producer_waits_for_idle_queue() {
        let dir = tree();
        let store = Arc::new(InMemoryStore::new());
        let mut settings = settings(&dir, &[]);
        settings.set_daemon(true);
        settings.set_daemon_scan_interval(Duration::from_millis(20));
        let (ctx, _) = context(&store, settings);

        let producer = Arc::new(SyncProducer::new(ctx.clone(), 1));
        let handle = {
            let producer = Arc::clone(&producer);
            tokio::spawn(async move { producer.run().await })
        };

        // Nothing consumes the queue, so no second scan may start
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.calls_to("asset.exists"), 1);
        assert!(producer.has_pending_work());

        drain(&ctx.queue);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.calls_to("asset.exists") >= 2);

        ctx.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
