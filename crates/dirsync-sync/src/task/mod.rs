//! Tasks
//!
//! A [`Task`] is one unit of work with a lifecycle state, progress counters,
//! a current-operation label and an abort handle. The work itself is one of
//! a closed set of kinds:
//!
//! | kind               | produced by              | does |
//! |--------------------|--------------------------|------|
//! | `namespace.create` | tree scanner             | creates a namespace unless it exists |
//! | `file.upload`      | checker, watcher         | uploads one file, with checksum retry |
//! | `asset.download`   | remote scanner           | downloads one asset to a local file |
//! | `asset.destroy`    | watcher                  | soft-destroys one asset |
//! | `file.check`       | tree scanner             | classifies a batch of upload candidates |
//! | `poison`           | producer at end of a run | stops the consumer that takes it |
//!
//! Every kind runs through [`Task::execute`], which drives the state
//! machine of [`TaskState`] and links the task's abort handle to the
//! pool-wide cancellation token.

pub mod check;
pub mod destroy;
pub mod download;
pub mod namespace;
pub mod upload;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dirsync_core::domain::{DomainError, RemotePath, Settings, TaskState};
use dirsync_core::ports::RemoteError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::metrics::SyncListener;
use crate::queue::TaskQueue;
use crate::session::RemoteSession;

pub use check::{BatchCheckTask, CheckItem, CheckOutcome, SyncDecision};
pub use destroy::DestroyTask;
pub use download::DownloadTask;
pub use namespace::NamespaceCreateTask;
pub use upload::UploadTask;

// ============================================================================
// Errors
// ============================================================================

/// Failure of a single task
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Remote(RemoteError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch for {}: local {local:08x}, remote {remote:?}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        local: u32,
        remote: Option<u32>,
    },

    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl TaskError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::Interrupted {
            return TaskError::Cancelled;
        }
        TaskError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<RemoteError> for TaskError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Aborted => TaskError::Cancelled,
            other => TaskError::Remote(other),
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Work counters of a task, readable while it runs
#[derive(Debug)]
pub struct TaskProgress {
    /// -1 while unknown
    total: AtomicI64,
    progressed: AtomicI64,
    operation: Mutex<String>,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            total: AtomicI64::new(-1),
            progressed: AtomicI64::new(0),
            operation: Mutex::new(String::new()),
        }
    }
}

impl TaskProgress {
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn progressed(&self) -> i64 {
        self.progressed.load(Ordering::Relaxed)
    }

    pub fn set_progressed(&self, progressed: i64) {
        self.progressed.store(progressed, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.progressed.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn operation(&self) -> String {
        self.operation.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn set_operation(&self, operation: impl Into<String>) {
        if let Ok(mut current) = self.operation.lock() {
            *current = operation.into();
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Everything a task needs while it runs
#[derive(Clone)]
pub struct TaskContext {
    pub session: Arc<RemoteSession>,
    pub settings: Arc<Settings>,
    pub listener: Arc<dyn SyncListener>,
    /// Where checkers put the uploads they schedule
    pub queue: Arc<TaskQueue>,
    /// Pool-wide cancellation
    pub cancel: CancellationToken,
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug)]
pub enum TaskKind {
    NamespaceCreate(NamespaceCreateTask),
    Upload(UploadTask),
    Download(DownloadTask),
    Destroy(DestroyTask),
    BatchCheck(BatchCheckTask),
    Poison,
}

impl TaskKind {
    async fn run(
        &mut self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
    ) -> Result<(), TaskError> {
        match self {
            TaskKind::NamespaceCreate(task) => task.run(ctx, progress, abort).await,
            TaskKind::Upload(task) => task.run(ctx, progress, abort).await,
            TaskKind::Download(task) => task.run(ctx, progress, abort).await,
            TaskKind::Destroy(task) => task.run(ctx, progress, abort).await,
            TaskKind::BatchCheck(task) => task.run(ctx, progress, abort).await,
            TaskKind::Poison => Ok(()),
        }
    }
}

/// A unit of work owned by one queue or worker at a time
#[derive(Debug)]
pub struct Task {
    id: Uuid,
    kind: TaskKind,
    state: TaskState,
    progress: Arc<TaskProgress>,
    abort: CancellationToken,
}

impl Task {
    fn new(kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: TaskState::Pending,
            progress: Arc::new(TaskProgress::default()),
            abort: CancellationToken::new(),
        }
    }

    pub fn namespace_create(namespace: RemotePath) -> Self {
        Self::new(TaskKind::NamespaceCreate(NamespaceCreateTask::new(namespace)))
    }

    pub fn upload(file: PathBuf, asset_path: RemotePath) -> Self {
        Self::new(TaskKind::Upload(UploadTask::new(file, asset_path)))
    }

    pub fn download(asset_path: RemotePath, file: PathBuf, remote_mtime: i64) -> Self {
        Self::new(TaskKind::Download(DownloadTask::new(
            asset_path,
            file,
            remote_mtime,
        )))
    }

    pub fn destroy(asset_path: RemotePath) -> Self {
        Self::new(TaskKind::Destroy(DestroyTask::new(asset_path)))
    }

    pub fn batch_check(items: Vec<CheckItem>) -> Self {
        Self::new(TaskKind::BatchCheck(BatchCheckTask::new(items)))
    }

    pub fn poison() -> Self {
        Self::new(TaskKind::Poison)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn progress(&self) -> &TaskProgress {
        &self.progress
    }

    /// Handle that aborts this task cooperatively when cancelled
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_poison(&self) -> bool {
        matches!(self.kind, TaskKind::Poison)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::NamespaceCreate(_) => "namespace.create",
            TaskKind::Upload(_) => "file.upload",
            TaskKind::Download(_) => "asset.download",
            TaskKind::Destroy(_) => "asset.destroy",
            TaskKind::BatchCheck(_) => "file.check",
            TaskKind::Poison => "poison",
        }
    }

    /// Runs the task to a terminal state
    ///
    /// Cancelling `ctx.cancel` fires the task's abort handle; the task is
    /// still driven to completion so it can roll back, and ends `Failed`.
    ///
    /// # Errors
    /// Returns the task's failure, or [`TaskError::Domain`] if the task was
    /// already executed
    pub async fn execute(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.state.transition_to(TaskState::Executing)?;
        debug!(task_id = %self.id, task = %self, "Executing task");
        if ctx.cancel.is_cancelled() {
            self.abort.cancel();
        }

        let result = {
            let run = self.kind.run(ctx, &self.progress, &self.abort);
            tokio::pin!(run);
            tokio::select! {
                biased;
                result = &mut run => result,
                _ = ctx.cancel.cancelled() => {
                    self.abort.cancel();
                    run.await
                }
            }
        };
        let result = match result {
            Err(TaskError::Remote(_)) | Err(TaskError::Io { .. }) if self.abort.is_cancelled() => {
                Err(TaskError::Cancelled)
            }
            other => other,
        };

        match &result {
            Ok(()) => self.state.transition_to(TaskState::Completed)?,
            Err(err) => self.state.transition_to(TaskState::Failed(err.to_string()))?,
        }
        debug!(task_id = %self.id, state = self.state.name(), "Task finished");
        result
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TaskKind::NamespaceCreate(t) => write!(f, "namespace.create {}", t.namespace()),
            TaskKind::Upload(t) => write!(
                f,
                "file.upload {} -> {}",
                t.file().display(),
                t.asset_path()
            ),
            TaskKind::Download(t) => write!(
                f,
                "asset.download {} -> {}",
                t.asset_path(),
                t.file().display()
            ),
            TaskKind::Destroy(t) => write!(f, "asset.destroy {}", t.asset_path()),
            TaskKind::BatchCheck(t) => write!(f, "file.check ({} files)", t.items().len()),
            TaskKind::Poison => f.write_str("poison"),
        }
    }
}

// ============================================================================
// Test support
// ============================================================================
