//! File upload
//!
//! ```text
//! stat file ─► asset exists? ─► current? ──yes──► skipped
//!                                  │no
//!                                  ▼
//!              stream 8 KiB chunks (progress, CRC32, abort check)
//!                                  │
//!              create (auto-creating namespaces) or set by id
//!                                  │
//!              checksum differs? ──yes──► roll back, retry once
//!                                  │no
//!              undestroy if the asset was soft-deleted ─► completed
//! ```
//!
//! Progress is counted per chunk on the task and the listener. Any failure
//! rolls back the bytes counted by the current attempt before the error is
//! reported, so an aborted or failed upload leaves the totals unchanged.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dirsync_core::domain::asset::mtime_millis;
use dirsync_core::domain::{AssetMetadata, PosixAttributes, RemotePath};
use dirsync_core::ports::{ByteStream, ServiceInput};
use futures_util::{stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TaskContext, TaskError, TaskProgress};
use crate::metrics::SyncListener;

/// Size of the chunks content is streamed in
pub const CHUNK_SIZE: usize = 8192;

/// Extra attempts after the store reports a different checksum
const CHECKSUM_RETRIES: u32 = 1;

#[derive(Debug, Clone)]
pub struct UploadTask {
    file: PathBuf,
    asset_path: RemotePath,
    checksum_retries: u32,
}

enum UploadOutcome {
    Skipped,
    Uploaded(String),
}

impl UploadTask {
    pub fn new(file: PathBuf, asset_path: RemotePath) -> Self {
        Self {
            file,
            asset_path,
            checksum_retries: CHECKSUM_RETRIES,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn asset_path(&self) -> &RemotePath {
        &self.asset_path
    }

    pub(crate) async fn run(
        &mut self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
    ) -> Result<(), TaskError> {
        let transfer = Arc::new(Transfer::new());
        match self.upload(ctx, progress, abort, &transfer).await {
            Ok(UploadOutcome::Skipped) => {
                ctx.listener.skipped(&self.file);
                Ok(())
            }
            Ok(UploadOutcome::Uploaded(asset_id)) => {
                ctx.listener.completed(&self.file, &asset_id);
                Ok(())
            }
            Err(err) => {
                transfer.rewind(progress, ctx.listener.as_ref());
                ctx.listener.failed(&self.file, &err.to_string());
                Err(err)
            }
        }
    }

    async fn upload(
        &mut self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
        transfer: &Arc<Transfer>,
    ) -> Result<UploadOutcome, TaskError> {
        progress.set_operation(format!("checking {}", self.asset_path));
        let metadata = tokio::fs::metadata(&self.file)
            .await
            .map_err(|e| TaskError::io(&self.file, e))?;
        let local_size = metadata.len();
        progress.set_total(local_size as i64);

        let existing = if ctx.session.asset_exists(&self.asset_path, Some(abort)).await? {
            ctx.session.asset_get(&self.asset_path, Some(abort)).await?
        } else {
            None
        };
        let csum_check = ctx.settings.csum_check();

        if let Some(asset) = &existing {
            if self
                .is_current(asset, local_size, mtime_millis(&metadata), csum_check)
                .await?
            {
                if asset.destroyed {
                    ctx.session
                        .soft_undestroy(std::slice::from_ref(&asset.id), Some(abort))
                        .await?;
                }
                progress.set_progressed(local_size as i64);
                return Ok(UploadOutcome::Skipped);
            }
        }

        ctx.listener.started(&self.file);
        let posix =
            PosixAttributes::from_path(&self.file).map_err(|e| TaskError::io(&self.file, e))?;
        let mut asset_id = existing.as_ref().map(|a| a.id.clone());

        loop {
            progress.set_operation(format!("uploading {}", self.asset_path));
            let asset = self
                .send(ctx, progress, abort, transfer, asset_id.as_deref(), &posix, local_size)
                .await?;

            if csum_check {
                let local = transfer.crc32();
                let remote = asset.content_csum();
                if remote != Some(local) {
                    transfer.rewind(progress, ctx.listener.as_ref());
                    if self.checksum_retries == 0 {
                        return Err(TaskError::ChecksumMismatch {
                            path: self.file.clone(),
                            local,
                            remote,
                        });
                    }
                    self.checksum_retries -= 1;
                    warn!(
                        path = %self.file.display(),
                        local = %format!("{local:08x}"),
                        remote = ?remote,
                        "Checksum mismatch, uploading again"
                    );
                    asset_id = Some(asset.id);
                    continue;
                }
            }

            if existing.as_ref().is_some_and(|a| a.destroyed) {
                ctx.session
                    .soft_undestroy(std::slice::from_ref(&asset.id), Some(abort))
                    .await?;
            }
            debug!(path = %self.file.display(), asset_id = %asset.id, "Upload finished");
            return Ok(UploadOutcome::Uploaded(asset.id));
        }
    }

    /// Whether the stored copy already matches the local file
    async fn is_current(
        &self,
        asset: &AssetMetadata,
        local_size: u64,
        local_mtime: i64,
        csum_check: bool,
    ) -> Result<bool, TaskError> {
        // Without a stored mtime there is nothing to prove the copy current
        if asset.posix_mtime().is_none() || asset.is_stale(local_size, local_mtime) {
            return Ok(false);
        }
        if !csum_check {
            return Ok(true);
        }
        let local = file_crc32(&self.file)
            .await
            .map_err(|e| TaskError::io(&self.file, e))?;
        Ok(asset.content_csum() == Some(local))
    }

    /// Streams the content once, as a create or an update
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
        transfer: &Arc<Transfer>,
        asset_id: Option<&str>,
        posix: &PosixAttributes,
        length: u64,
    ) -> Result<AssetMetadata, TaskError> {
        // Invoked again when the session retries; the previous attempt's
        // bytes no longer count
        let make_input = || {
            transfer.rewind(progress, ctx.listener.as_ref());
            transfer.reset_crc();
            ServiceInput {
                length,
                stream: ChunkReader {
                    path: self.file.clone(),
                    file: None,
                    done: false,
                    transfer: Arc::clone(transfer),
                    progress: Arc::clone(progress),
                    listener: Arc::clone(&ctx.listener),
                    abort: abort.clone(),
                }
                .into_stream(),
            }
        };

        let asset = match asset_id {
            Some(id) => {
                ctx.session
                    .asset_set(id, posix, make_input, Some(abort))
                    .await?
            }
            None => {
                ctx.session
                    .asset_create(&self.asset_path, posix, make_input, Some(abort))
                    .await?
            }
        };
        Ok(asset)
    }
}

// ============================================================================
// Transfer accounting
// ============================================================================

/// Bytes and checksum of the attempt in progress
struct Transfer {
    bytes: AtomicI64,
    crc: Mutex<crc32fast::Hasher>,
}

impl Transfer {
    fn new() -> Self {
        Self {
            bytes: AtomicI64::new(0),
            crc: Mutex::new(crc32fast::Hasher::new()),
        }
    }

    fn record(&self, chunk: &[u8], progress: &TaskProgress, listener: &dyn SyncListener) {
        let n = chunk.len() as i64;
        self.bytes.fetch_add(n, Ordering::Relaxed);
        if let Ok(mut crc) = self.crc.lock() {
            crc.update(chunk);
        }
        progress.add(n);
        listener.progressed(n);
    }

    /// Subtracts everything this attempt counted
    fn rewind(&self, progress: &TaskProgress, listener: &dyn SyncListener) {
        let n = self.bytes.swap(0, Ordering::Relaxed);
        if n != 0 {
            progress.add(-n);
            listener.progressed(-n);
        }
    }

    fn reset_crc(&self) {
        if let Ok(mut crc) = self.crc.lock() {
            *crc = crc32fast::Hasher::new();
        }
    }

    fn crc32(&self) -> u32 {
        self.crc
            .lock()
            .map(|crc| crc.clone().finalize())
            .unwrap_or_default()
    }
}

/// Reads a file chunk by chunk into an upload stream
struct ChunkReader {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    done: bool,
    transfer: Arc<Transfer>,
    progress: Arc<TaskProgress>,
    listener: Arc<dyn SyncListener>,
    abort: CancellationToken,
}

impl ChunkReader {
    async fn next_chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
        if self.done {
            return None;
        }
        if self.abort.is_cancelled() {
            self.done = true;
            return Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "upload aborted",
            )));
        }
        if self.file.is_none() {
            match tokio::fs::File::open(&self.path).await {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let file = self.file.as_mut()?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                self.transfer
                    .record(&buf, &self.progress, self.listener.as_ref());
                Some(Ok(buf))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn into_stream(self) -> ByteStream {
        stream::unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk().await?;
            Some((chunk, reader))
        })
        .boxed()
    }
}

/// CRC32 of a whole file
async fn file_crc32(path: &Path) -> io::Result<u32> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::*;
    use crate::task::Task;

    use dirsync_core::domain::Settings;
    use dirsync_core::ports::services;
    use dirsync_remote::InMemoryStore;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn csum_settings() -> Settings {
        let mut settings = Settings::new();
        settings.set_csum_check(true);
        settings
    }

    #[tokio::test]
    async fn test_new_file_is_created_with_posix_attributes() {
        let dir = TempDir::new().unwrap();
        let data = vec![3u8; CHUNK_SIZE * 2 + 100];
        let file = write(&dir, "a.bin", &data);
        let store = Arc::new(InMemoryStore::new());
        let (ctx, metrics) = context(&store, Settings::new());

        let mut task = Task::upload(file.clone(), rp("/ns/sub/a.bin"));
        task.execute(&ctx).await.unwrap();

        assert_eq!(store.content("/ns/sub/a.bin").unwrap(), data);
        let asset = store.asset("/ns/sub/a.bin").unwrap();
        let local = PosixAttributes::from_path(&file).unwrap();
        assert_eq!(asset.posix_mtime(), Some(local.mtime));

        let snap = metrics.snapshot();
        assert_eq!(snap.uploaded, 1);
        assert_eq!(snap.uploaded_bytes, data.len() as i64);
        assert_eq!(snap.recent_activities.len(), 1);
        assert_eq!(task.progress().progressed(), data.len() as i64);
    }

    #[tokio::test]
    async fn test_current_asset_is_skipped() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"hello");
        let store = Arc::new(InMemoryStore::new());
        let posix = PosixAttributes::from_path(&file).unwrap();
        store.put_asset(&rp("/ns/a.txt"), b"hello", Some(posix));
        let (ctx, metrics) = context(&store, csum_settings());

        Task::upload(file, rp("/ns/a.txt")).execute(&ctx).await.unwrap();
        assert_eq!(store.calls_to(services::ASSET_SET), 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.uploaded, 0);
    }

    #[tokio::test]
    async fn test_asset_without_stored_mtime_is_updated() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"hello");
        let store = Arc::new(InMemoryStore::new());
        store.put_asset(&rp("/ns/a.txt"), b"HELLO", None);
        let (ctx, metrics) = context(&store, Settings::new());

        Task::upload(file, rp("/ns/a.txt")).execute(&ctx).await.unwrap();
        assert_eq!(store.content("/ns/a.txt").unwrap(), b"hello");
        let snap = metrics.snapshot();
        assert_eq!(snap.uploaded, 1);
        assert_eq!(snap.skipped, 0);
    }

    #[tokio::test]
    async fn test_checksum_difference_forces_update() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"hello");
        let store = Arc::new(InMemoryStore::new());
        let posix = PosixAttributes::from_path(&file).unwrap();
        // Same size and mtime, different bytes
        store.put_asset(&rp("/ns/a.txt"), b"HELLO", Some(posix));
        let (ctx, metrics) = context(&store, csum_settings());

        Task::upload(file, rp("/ns/a.txt")).execute(&ctx).await.unwrap();
        assert_eq!(store.content("/ns/a.txt").unwrap(), b"hello");
        assert_eq!(store.calls_to(services::ASSET_SET), 1);
        assert_eq!(metrics.snapshot().uploaded, 1);
    }

    #[tokio::test]
    async fn test_single_checksum_mismatch_is_retried() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"0123456789");
        let store = Arc::new(InMemoryStore::new());
        store.corrupt_next_checksums(1);
        let (ctx, metrics) = context(&store, csum_settings());

        let mut task = Task::upload(file, rp("/ns/a.txt"));
        task.execute(&ctx).await.unwrap();

        assert_eq!(store.calls_to(services::ASSET_CREATE), 1);
        assert_eq!(store.calls_to(services::ASSET_SET), 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.uploaded, 1);
        assert_eq!(snap.uploaded_bytes, 10);
        assert_eq!(task.progress().progressed(), 10);
    }

    #[tokio::test]
    async fn test_second_checksum_mismatch_fails_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"0123456789");
        let store = Arc::new(InMemoryStore::new());
        store.corrupt_next_checksums(2);
        let (ctx, metrics) = context(&store, csum_settings());

        let mut task = Task::upload(file.clone(), rp("/ns/a.txt"));
        let err = task.execute(&ctx).await.unwrap_err();

        assert!(matches!(err, TaskError::ChecksumMismatch { .. }));
        assert!(task.state().is_failed());
        assert_eq!(task.progress().progressed(), 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.uploaded_bytes, 0);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.failed_files, vec![file]);
    }

    #[tokio::test]
    async fn test_connection_failures_are_retried_transparently() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"abcdef");
        let store = Arc::new(InMemoryStore::new());
        let (ctx, metrics) = context(&store, Settings::new());
        store.fail_next_connections(2);

        let mut task = Task::upload(file, rp("/ns/a.txt"));
        task.execute(&ctx).await.unwrap();
        assert_eq!(store.content("/ns/a.txt").unwrap(), b"abcdef");
        assert_eq!(metrics.snapshot().uploaded_bytes, 6);
    }

    #[tokio::test]
    async fn test_soft_deleted_asset_is_undestroyed_after_update() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.txt", b"new content");
        let store = Arc::new(InMemoryStore::new());
        store.put_asset(&rp("/ns/a.txt"), b"old", None);
        store.soft_destroy("/ns/a.txt");
        let (ctx, _) = context(&store, Settings::new());

        Task::upload(file, rp("/ns/a.txt")).execute(&ctx).await.unwrap();
        let asset = store.asset("/ns/a.txt").unwrap();
        assert!(!asset.destroyed);
        assert_eq!(asset.content_size(), Some(11));
        assert_eq!(store.calls_to(services::ASSET_SOFT_UNDESTROY), 1);
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_remote_writes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let (ctx, metrics) = context(&store, Settings::new());

        let err = Task::upload(dir.path().join("gone"), rp("/ns/gone"))
            .execute(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Io { .. }));
        assert_eq!(store.asset_count(), 0);
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_aborted_upload_rolls_back() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.bin", &vec![1u8; CHUNK_SIZE * 4]);
        let store = Arc::new(InMemoryStore::new());
        let (ctx, metrics) = context(&store, Settings::new());

        let mut task = Task::upload(file, rp("/ns/a.bin"));
        task.abort_handle().cancel();
        let err = task.execute(&ctx).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(store.asset_count(), 0);
        assert_eq!(metrics.snapshot().uploaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_file_crc32_matches_whole_content() {
        let dir = TempDir::new().unwrap();
        let data = vec![9u8; CHUNK_SIZE + 1];
        let file = write(&dir, "c", &data);
        assert_eq!(file_crc32(&file).await.unwrap(), crc32fast::hash(&data));
    }
}
