//! Batch staleness check
//!
//! Classifies a batch of upload candidates with two round-trips at most:
//!
//! ```text
//! asset.exists(all) ──missing──► CREATE (queued at once)
//!        │existing
//!        ▼
//! asset.get(existing) ──► per asset, in the order the store lists them:
//!        soft-deleted?              ──► undestroy (one call per batch)
//!        no content / size differs /
//!        local mtime newer?         ──► UPDATE (queued after undestroy)
//!        otherwise                  ──► SKIP (reported to the listener)
//! ```
//!
//! Checksums are not compared here; the upload task does that when it runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dirsync_core::domain::asset::mtime_millis;
use dirsync_core::domain::RemotePath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Task, TaskContext, TaskError, TaskProgress};

/// One upload candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckItem {
    pub file: PathBuf,
    pub asset_path: RemotePath,
}

impl CheckItem {
    pub fn new(file: PathBuf, asset_path: RemotePath) -> Self {
        Self { file, asset_path }
    }
}

/// What the checker decided for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Skip,
    Create,
    Update,
    UndestroyThenSkip,
    UndestroyThenUpdate,
}

impl SyncDecision {
    pub fn schedules_upload(&self) -> bool {
        matches!(
            self,
            SyncDecision::Create | SyncDecision::Update | SyncDecision::UndestroyThenUpdate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub file: PathBuf,
    pub asset_path: RemotePath,
    pub decision: SyncDecision,
}

#[derive(Debug, Clone, Default)]
pub struct BatchCheckTask {
    items: Vec<CheckItem>,
    outcomes: Vec<CheckOutcome>,
}

impl BatchCheckTask {
    pub fn new(items: Vec<CheckItem>) -> Self {
        Self {
            items,
            outcomes: Vec::new(),
        }
    }

    pub fn items(&self) -> &[CheckItem] {
        &self.items
    }

    /// Decisions of the last run, in the order they were made
    pub fn outcomes(&self) -> &[CheckOutcome] {
        &self.outcomes
    }

    pub(crate) async fn run(
        &mut self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
    ) -> Result<(), TaskError> {
        progress.set_total(self.items.len() as i64);
        progress.set_operation(format!("checking {} files", self.items.len()));
        let mut outcomes = Vec::with_capacity(self.items.len());

        // Keyed by remote path; a later duplicate replaces an earlier one
        let mut candidates: HashMap<RemotePath, &CheckItem> = HashMap::new();
        for item in &self.items {
            candidates.insert(item.asset_path.clone(), item);
        }
        let paths: Vec<RemotePath> = candidates.keys().cloned().collect();
        let exists = ctx.session.assets_exist(&paths, Some(abort)).await?;

        let mut existing = Vec::new();
        for (path, exists) in paths.into_iter().zip(exists) {
            if exists {
                existing.push(path);
                continue;
            }
            if let Some(item) = candidates.get(&path) {
                ctx.queue
                    .put(Task::upload(item.file.clone(), item.asset_path.clone()));
                outcomes.push(outcome(item, SyncDecision::Create));
            }
        }

        let assets = ctx.session.assets_get(&existing, Some(abort)).await?;
        let mut undestroy = Vec::new();
        let mut updates = Vec::new();
        for asset in assets {
            let Some(item) = candidates.get(&asset.path) else {
                continue;
            };
            let metadata = match tokio::fs::metadata(&item.file).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %item.file.display(), error = %e, "File disappeared before check");
                    continue;
                }
            };

            let update = asset.is_stale(metadata.len(), mtime_millis(&metadata));
            let decision = match (asset.destroyed, update) {
                (false, false) => SyncDecision::Skip,
                (false, true) => SyncDecision::Update,
                (true, false) => SyncDecision::UndestroyThenSkip,
                (true, true) => SyncDecision::UndestroyThenUpdate,
            };
            if asset.destroyed {
                undestroy.push(asset.id.clone());
            }
            if update {
                updates.push(Task::upload(item.file.clone(), item.asset_path.clone()));
            } else {
                ctx.listener.skipped(&item.file);
            }
            outcomes.push(outcome(item, decision));
        }

        if !undestroy.is_empty() {
            let count = ctx.session.soft_undestroy(&undestroy, Some(abort)).await?;
            debug!(count, "Restored soft-deleted assets");
        }
        for task in updates {
            ctx.queue.put(task);
        }

        progress.set_progressed(self.items.len() as i64);
        debug!(
            files = self.items.len(),
            scheduled = outcomes.iter().filter(|o| o.decision.schedules_upload()).count(),
            "Batch checked"
        );
        self.outcomes = outcomes;
        Ok(())
    }
}

fn outcome(item: &CheckItem, decision: SyncDecision) -> CheckOutcome {
    CheckOutcome {
        file: item.file.clone(),
        asset_path: item.asset_path.clone(),
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::*;
    use crate::task::TaskKind;

    use dirsync_core::domain::{PosixAttributes, Settings};
    use dirsync_core::ports::services;
    use dirsync_remote::InMemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<InMemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                store: Arc::new(InMemoryStore::new()),
            }
        }

        /// Writes a local file and returns its candidate
        fn file(&self, name: &str, data: &[u8]) -> CheckItem {
            let path = self.dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            CheckItem::new(path, rp(&format!("/ns/{name}")))
        }

        fn local_mtime(&self, item: &CheckItem) -> i64 {
            PosixAttributes::from_path(&item.file).unwrap().mtime
        }

        fn remote(&self, item: &CheckItem, data: &[u8], mtime: i64) {
            let posix = PosixAttributes {
                uid: 0,
                gid: 0,
                mode: 0o100644,
                ctime: mtime,
                mtime,
                symlink: None,
            };
            self.store.put_asset(&item.asset_path, data, Some(posix));
        }
    }

    fn decision_of(task: &Task, item: &CheckItem) -> SyncDecision {
        let TaskKind::BatchCheck(check) = task.kind() else {
            panic!("not a check task");
        };
        check
            .outcomes()
            .iter()
            .find(|o| o.file == item.file)
            .map(|o| o.decision)
            .unwrap()
    }

    #[tokio::test]
    async fn test_classification_table() {
        let fx = Fixture::new();
        let create = fx.file("create", b"12345");
        let no_content = fx.file("no_content", b"12345");
        let size = fx.file("size", b"12345");
        let newer = fx.file("newer", b"12345");
        let current = fx.file("current", b"12345");
        let deleted = fx.file("deleted", b"12345");

        fx.store.put_empty_asset(&no_content.asset_path, None);
        fx.remote(&size, b"1234", fx.local_mtime(&size) + 10_000);
        fx.remote(&newer, b"12345", fx.local_mtime(&newer) - 1);
        fx.remote(&current, b"12345", fx.local_mtime(&current));
        fx.remote(&deleted, b"12345", fx.local_mtime(&deleted) + 1);
        fx.store.soft_destroy(deleted.asset_path.as_str());

        let (ctx, metrics) = context(&fx.store, Settings::new());
        let items = vec![
            create.clone(),
            no_content.clone(),
            size.clone(),
            newer.clone(),
            current.clone(),
            deleted.clone(),
        ];
        let mut task = Task::batch_check(items);
        task.execute(&ctx).await.unwrap();

        assert_eq!(decision_of(&task, &create), SyncDecision::Create);
        assert_eq!(decision_of(&task, &no_content), SyncDecision::Update);
        assert_eq!(decision_of(&task, &size), SyncDecision::Update);
        assert_eq!(decision_of(&task, &newer), SyncDecision::Update);
        assert_eq!(decision_of(&task, &current), SyncDecision::Skip);
        assert_eq!(decision_of(&task, &deleted), SyncDecision::UndestroyThenSkip);

        assert!(!fx.store.asset(deleted.asset_path.as_str()).unwrap().destroyed);
        assert_eq!(metrics.snapshot().skipped, 2);

        let mut queued: Vec<PathBuf> = drain(&ctx.queue)
            .iter()
            .filter_map(|t| match t.kind() {
                TaskKind::Upload(u) => Some(u.file().to_path_buf()),
                _ => None,
            })
            .collect();
        queued.sort();
        let mut expected = vec![create.file, no_content.file, size.file, newer.file];
        expected.sort();
        assert_eq!(queued, expected);
    }

    #[tokio::test]
    async fn test_round_trips_are_per_batch() {
        let fx = Fixture::new();
        let mut items = Vec::new();
        for i in 0..20 {
            let item = fx.file(&format!("f{i}"), b"x");
            if i % 2 == 0 {
                fx.remote(&item, b"x", fx.local_mtime(&item));
                fx.store.soft_destroy(item.asset_path.as_str());
            }
            items.push(item);
        }
        let (ctx, _) = context(&fx.store, Settings::new());

        Task::batch_check(items).execute(&ctx).await.unwrap();
        assert_eq!(fx.store.calls_to(services::ASSET_EXISTS), 1);
        assert_eq!(fx.store.calls_to(services::ASSET_GET), 1);
        assert_eq!(fx.store.calls_to(services::ASSET_SOFT_UNDESTROY), 1);
        assert_eq!(ctx.queue.len(), 10);
    }

    #[tokio::test]
    async fn test_all_new_batch_skips_metadata_call() {
        let fx = Fixture::new();
        let items = vec![fx.file("a", b"a"), fx.file("b", b"b")];
        let (ctx, _) = context(&fx.store, Settings::new());

        Task::batch_check(items).execute(&ctx).await.unwrap();
        assert_eq!(fx.store.calls_to(services::ASSET_GET), 0);
        assert_eq!(ctx.queue.len(), 2);
    }
}
