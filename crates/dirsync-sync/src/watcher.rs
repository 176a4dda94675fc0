//! Filesystem watcher producer
//!
//! Wraps the `notify` crate to follow every directory of the upload jobs and
//! turns raw OS events into tasks on the shared queue. Watch events are
//! already deltas, so they bypass the batch checker.
//!
//! ```text
//! inotify ──► TreeWatcher ──► mpsc(1024) ──► FileWatchProducer ──► TaskQueue
//!                 ▲                                 │
//!                 └──── register new directories ───┘
//! ```
//!
//! Directories are watched one by one (non-recursively) so that a directory
//! created while the watcher runs is registered, together with everything
//! already below it, before its contents are scanned.
//!
//! The directory walk behind a registration runs on the blocking pool, so a
//! large new subtree does not stall the runtime thread handling events.
//!
//! Lost events (queue overflow) are logged and not recovered.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use dirsync_core::domain::{Job, JobType, RemotePath};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::scanner::TreeScanner;
use crate::task::{Task, TaskContext};

/// Capacity of the event channel between the OS callback and the producer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Change events
// ============================================================================

/// A filesystem change, decoupled from `notify`'s event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    /// Events were dropped by the OS
    Overflow,
}

/// Converts a `notify::Event` into change events
///
/// A rename becomes a deletion of the old path plus a creation of the new
/// one. Paired renames (`RenameMode::Both`) are ignored because the backend
/// reports both halves separately as well.
fn map_notify_event(event: &notify::Event) -> Vec<ChangeEvent> {
    if event.need_rescan() {
        return vec![ChangeEvent::Overflow];
    }
    let Some(path) = event.paths.first().cloned() else {
        return Vec::new();
    };

    match &event.kind {
        EventKind::Create(_) => vec![ChangeEvent::Created(path)],
        EventKind::Remove(_) => vec![ChangeEvent::Deleted(path)],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![ChangeEvent::Deleted(path)],
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![ChangeEvent::Created(path)],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Backend could not tell which side of the rename this is
            if path.exists() {
                vec![ChangeEvent::Created(path)]
            } else {
                vec![ChangeEvent::Deleted(path)]
            }
        }
        EventKind::Modify(_) => vec![ChangeEvent::Modified(path)],
        _ => Vec::new(),
    }
}

// ============================================================================
// Tree watcher
// ============================================================================

/// OS watcher plus the set of directories it follows
pub struct TreeWatcher {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl TreeWatcher {
    /// Creates the watcher and the receiver its events arrive on
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for change in map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            debug!(error = %e, "Dropping change event, receiver closed");
                        }
                    }
                }
                Err(err) => error!(error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((
            Self {
                watcher,
                watched: HashSet::new(),
            },
            rx,
        ))
    }

    /// Watches `dir` and every directory below it; returns how many were added
    pub fn register_all(&mut self, dir: &Path) -> Result<usize> {
        let mut added = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            if !self.watched.contains(&dir) {
                self.watcher
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .with_context(|| format!("Failed to watch {}", dir.display()))?;
                self.watched.insert(dir.clone());
                added += 1;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Cannot list directory to watch");
                    continue;
                }
            };
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    pending.push(entry.path());
                }
            }
        }
        debug!(root = %dir.display(), added, "Registered directories");
        Ok(added)
    }

    /// Forgets `path` and every watched directory below it
    pub fn unregister(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|w| w.starts_with(path))
            .cloned()
            .collect();
        for dir in gone {
            // The OS usually drops the watch itself when the directory goes
            let _ = self.watcher.unwatch(&dir);
            self.watched.remove(&dir);
        }
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Turns change events under the upload jobs into tasks
pub struct FileWatchProducer {
    ctx: TaskContext,
    watcher: Arc<Mutex<TreeWatcher>>,
    events: mpsc::Receiver<ChangeEvent>,
}

impl FileWatchProducer {
    /// Starts watching every upload job directory
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created or a job
    /// directory cannot be watched
    pub fn new(ctx: TaskContext) -> Result<Self> {
        let (mut watcher, events) = TreeWatcher::new()?;
        for job in ctx.settings.jobs_of_type(JobType::Upload) {
            let added = watcher.register_all(job.directory())?;
            info!(directory = %job.directory().display(), directories = added, "Watching job");
        }
        Ok(Self {
            ctx,
            watcher: Arc::new(Mutex::new(watcher)),
            events,
        })
    }

    // The watch set stays consistent even if a registration panicked.
    fn tree(&self) -> MutexGuard<'_, TreeWatcher> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn watched_count(&self) -> usize {
        self.tree().watched_count()
    }

    /// Handles events until cancelled or nothing is left to watch
    pub async fn run(mut self) {
        while self.watched_count() > 0 {
            let event = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                warn!("Watcher channel closed");
                break;
            };
            self.handle(event).await;
        }
        info!(watched = self.watched_count(), "File watcher stopped");
    }

    async fn handle(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::Created(path) => match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_dir() => self.directory_created(&path).await,
                Ok(metadata) if metadata.is_file() => self.enqueue_uploads(&path),
                Ok(_) => debug!(path = %path.display(), "Ignoring non-regular file"),
                Err(e) => debug!(path = %path.display(), error = %e, "Created path vanished"),
            },
            ChangeEvent::Modified(path) => {
                if tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    self.enqueue_uploads(&path);
                }
            }
            ChangeEvent::Deleted(path) => {
                self.tree().unregister(&path);
                if self.ctx.settings.sync_local_deletion() {
                    self.path_deleted(&path).await;
                }
            }
            ChangeEvent::Overflow => {
                warn!("Filesystem events were lost, changes may be missed until the next scan");
            }
        }
    }

    fn upload_jobs_matching(&self, path: &Path) -> Vec<Job> {
        self.ctx
            .settings
            .jobs_matching(path)
            .into_iter()
            .filter(|job| job.job_type() == JobType::Upload)
            .cloned()
            .collect()
    }

    async fn directory_created(&mut self, dir: &Path) {
        let watcher = Arc::clone(&self.watcher);
        let root = dir.to_path_buf();
        let registered = tokio::task::spawn_blocking(move || {
            watcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .register_all(&root)
        })
        .await;
        match registered {
            Ok(Ok(added)) => debug!(path = %dir.display(), directories = added, "Watching new directory"),
            Ok(Err(e)) => warn!(path = %dir.display(), error = %e, "Failed to watch new directory"),
            Err(e) => warn!(path = %dir.display(), error = %e, "Directory registration did not finish"),
        }

        for job in self.upload_jobs_matching(dir) {
            let rebased = match job.rebased(dir) {
                Ok(rebased) => rebased,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Cannot derive job for directory");
                    continue;
                }
            };
            info!(directory = %dir.display(), namespace = %rebased.namespace(), "Scanning new directory");
            let mut settings = self.ctx.settings.copy(false);
            settings.add_job(rebased);
            let ctx = TaskContext {
                settings: Arc::new(settings),
                ..self.ctx.clone()
            };
            TreeScanner::direct(ctx).scan().await;
        }
    }

    fn enqueue_uploads(&self, file: &Path) {
        if self.ctx.settings.is_log_file(file) {
            return;
        }
        for job in self.upload_jobs_matching(file) {
            match job.remote_path_for(file) {
                Ok(asset_path) => {
                    debug!(path = %file.display(), asset_path = %asset_path, "Queueing upload for change");
                    self.ctx.queue.put(Task::upload(file.to_path_buf(), asset_path));
                }
                Err(e) => warn!(path = %file.display(), error = %e, "Cannot map changed file"),
            }
        }
    }

    async fn path_deleted(&self, path: &Path) {
        for job in self.upload_jobs_matching(path) {
            let remote = match job.remote_path_for(path) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot map deleted path");
                    continue;
                }
            };
            if let Err(e) = self.destroy_remote(&remote).await {
                error!(path = %path.display(), remote = %remote, error = %e, "Failed to sync local deletion");
            }
        }
    }

    async fn destroy_remote(&self, remote: &RemotePath) -> Result<()> {
        let session = &self.ctx.session;
        let abort = Some(&self.ctx.cancel);
        if session.namespace_exists(remote, abort).await? {
            let count = session.soft_destroy_namespace(remote, abort).await?;
            info!(namespace = %remote, count, "Soft-destroyed namespace of deleted directory");
        }
        if session.asset_exists(remote, abort).await? {
            self.ctx.queue.put(Task::destroy(remote.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::*;
    use crate::task::TaskKind;

    use dirsync_core::domain::Settings;
    use dirsync_remote::InMemoryStore;
    use notify::event::{CreateKind, DataChange, Flag, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_map_create_modify_remove() {
        assert_eq!(
            map_notify_event(&event(EventKind::Create(CreateKind::File), "/a")),
            vec![ChangeEvent::Created(PathBuf::from("/a"))]
        );
        assert_eq!(
            map_notify_event(&event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/a"
            )),
            vec![ChangeEvent::Modified(PathBuf::from("/a"))]
        );
        assert_eq!(
            map_notify_event(&event(EventKind::Remove(RemoveKind::Any), "/a")),
            vec![ChangeEvent::Deleted(PathBuf::from("/a"))]
        );
    }

    #[test]
    fn test_map_rename_halves() {
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), "/old");
        let to = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), "/new");
        let both = event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), "/old")
            .add_path(PathBuf::from("/new"));

        assert_eq!(map_notify_event(&from), vec![ChangeEvent::Deleted(PathBuf::from("/old"))]);
        assert_eq!(map_notify_event(&to), vec![ChangeEvent::Created(PathBuf::from("/new"))]);
        assert!(map_notify_event(&both).is_empty());
    }

    #[test]
    fn test_map_rescan_is_overflow() {
        let overflow = notify::Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(map_notify_event(&overflow), vec![ChangeEvent::Overflow]);
    }

    #[test]
    fn test_access_events_are_ignored() {
        let access = event(EventKind::Access(notify::event::AccessKind::Any), "/a");
        assert!(map_notify_event(&access).is_empty());
    }

    #[test]
    fn test_register_all_and_unregister() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::create_dir_all(dir.path().join("c")).unwrap();

        let (mut watcher, _rx) = TreeWatcher::new().unwrap();
        assert_eq!(watcher.register_all(dir.path()).unwrap(), 4);
        assert_eq!(watcher.register_all(dir.path()).unwrap(), 0);

        watcher.unregister(&dir.path().join("a"));
        assert_eq!(watcher.watched_count(), 2);
        assert!(watcher.is_watching(&dir.path().join("c")));
    }

    fn upload_settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::new();
        settings.add_job(Job::upload(dir.path(), rp("/ns")).unwrap());
        settings
    }

    #[tokio::test]
    async fn test_file_events_queue_uploads() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, upload_settings(&dir));
        let mut producer = FileWatchProducer::new(ctx.clone()).unwrap();

        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();
        producer.handle(ChangeEvent::Modified(file.clone())).await;

        let task = ctx.queue.try_take().unwrap();
        let TaskKind::Upload(upload) = task.kind() else {
            panic!("expected an upload");
        };
        assert_eq!(upload.asset_path().as_str(), "/ns/f.txt");
    }

    #[tokio::test]
    async fn test_new_directory_is_watched_and_scanned() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, upload_settings(&dir));
        let mut producer = FileWatchProducer::new(ctx.clone()).unwrap();

        let sub = dir.path().join("sub");
        std::fs::create_dir_all(sub.join("deeper")).unwrap();
        std::fs::write(sub.join("deeper/x.bin"), b"x").unwrap();
        producer.handle(ChangeEvent::Created(sub.clone())).await;

        assert!(producer.tree().is_watching(&sub.join("deeper")));
        let kinds: Vec<String> = drain(&ctx.queue).iter().map(|t| t.to_string()).collect();
        assert!(kinds.iter().any(|k| k.contains("/ns/sub/deeper")));
        assert!(kinds.iter().any(|k| k.contains("/ns/sub/deeper/x.bin")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_subtree_is_registered_off_the_runtime_thread() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, upload_settings(&dir));
        let mut producer = FileWatchProducer::new(ctx.clone()).unwrap();
        let before = producer.watched_count();

        let sub = dir.path().join("wide");
        for i in 0..40 {
            std::fs::create_dir_all(sub.join(format!("d{i}/inner"))).unwrap();
        }
        producer.handle(ChangeEvent::Created(sub.clone())).await;

        assert_eq!(producer.watched_count(), before + 1 + 80);
        assert!(producer.tree().is_watching(&sub.join("d39/inner")));
    }

    #[tokio::test]
    async fn test_registration_survives_poisoned_watch_set() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, upload_settings(&dir));
        let mut producer = FileWatchProducer::new(ctx.clone()).unwrap();

        let watcher = Arc::clone(&producer.watcher);
        let _ = std::thread::spawn(move || {
            let _guard = watcher.lock().unwrap();
            panic!("poison the watch set");
        })
        .join();
        assert!(producer.watcher.is_poisoned());

        let sub = dir.path().join("after");
        std::fs::create_dir_all(sub.join("deeper")).unwrap();
        producer.handle(ChangeEvent::Created(sub.clone())).await;

        assert!(producer.tree().is_watching(&sub.join("deeper")));
    }

    #[tokio::test]
    async fn test_deletion_sync_destroys_namespace_and_asset() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.put_asset(&rp("/ns/gone/a"), b"a", None);
        store.put_asset(&rp("/ns/file"), b"f", None);
        let mut settings = upload_settings(&dir);
        settings.set_sync_local_deletion(true);
        let (ctx, _) = context(&store, settings);
        let mut producer = FileWatchProducer::new(ctx.clone()).unwrap();

        producer.handle(ChangeEvent::Deleted(dir.path().join("gone"))).await;
        assert!(store.asset("/ns/gone/a").unwrap().destroyed);

        producer.handle(ChangeEvent::Deleted(dir.path().join("file"))).await;
        let task = ctx.queue.try_take().unwrap();
        assert!(matches!(task.kind(), TaskKind::Destroy(_)));
    }

    #[tokio::test]
    async fn test_deletion_ignored_without_deletion_sync() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.put_asset(&rp("/ns/file"), b"f", None);
        let (ctx, _) = context(&store, upload_settings(&dir));
        let mut producer = FileWatchProducer::new(ctx.clone()).unwrap();

        producer.handle(ChangeEvent::Deleted(dir.path().join("file"))).await;
        assert!(ctx.queue.is_empty());
        assert!(!store.asset("/ns/file").unwrap().destroyed);
    }

    #[tokio::test]
    async fn test_run_picks_up_os_events_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, _) = context(&store, upload_settings(&dir));
        let producer = FileWatchProducer::new(ctx.clone()).unwrap();
        let handle = tokio::spawn(producer.run());

        std::fs::write(dir.path().join("live.txt"), b"live").unwrap();
        let task = tokio::time::timeout(Duration::from_secs(5), ctx.queue.take())
            .await
            .expect("no task from watcher");
        assert_eq!(task.kind_name(), "file.upload");

        ctx.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
