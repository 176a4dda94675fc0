//! Asset download
//!
//! Content is written to `<file>.dirsync-part` next to the target and
//! renamed into place once complete, so an interrupted download never
//! leaves a truncated file behind. The finished file takes the asset's
//! stored mtime, which makes the next scan skip it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use dirsync_core::domain::asset::mtime_millis;
use dirsync_core::domain::RemotePath;
use dirsync_core::ports::ByteStream;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TaskContext, TaskError, TaskProgress};

const PART_SUFFIX: &str = ".dirsync-part";

#[derive(Debug, Clone)]
pub struct DownloadTask {
    asset_path: RemotePath,
    file: PathBuf,
    /// Stored mtime of the asset (ms)
    remote_mtime: i64,
}

impl DownloadTask {
    pub fn new(asset_path: RemotePath, file: PathBuf, remote_mtime: i64) -> Self {
        Self {
            asset_path,
            file,
            remote_mtime,
        }
    }

    pub fn asset_path(&self) -> &RemotePath {
        &self.asset_path
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub async fn is_local_current(&self) -> bool {
        is_local_current(&self.file, self.remote_mtime).await
    }

    pub(crate) async fn run(
        &mut self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
    ) -> Result<(), TaskError> {
        if self.is_local_current().await {
            debug!(path = %self.file.display(), "Local file is current, skipping download");
            progress.set_total(1);
            progress.set_progressed(1);
            return Ok(());
        }

        progress.set_operation(format!("downloading {}", self.asset_path));
        let (asset, mut output) = ctx
            .session
            .asset_download(&self.asset_path, Some(abort))
            .await?;
        let total = output.length.or(asset.content_size());
        progress.set_total(total.map_or(-1, |n| n as i64));

        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskError::io(parent, e))?;
        }

        let part = part_path(&self.file);
        if let Err(err) = write_stream(&part, &mut output.stream, progress, abort).await {
            if let Err(e) = tokio::fs::remove_file(&part).await {
                warn!(path = %part.display(), error = %e, "Failed to remove partial download");
            }
            return Err(err);
        }
        tokio::fs::rename(&part, &self.file)
            .await
            .map_err(|e| TaskError::io(&self.file, e))?;

        let mtime = asset.posix_mtime().unwrap_or(self.remote_mtime);
        set_mtime(&self.file, mtime).map_err(|e| TaskError::io(&self.file, e))?;

        ctx.listener.downloaded(&self.file);
        Ok(())
    }
}

/// Whether `file` exists and is at least as new as `remote_mtime` (ms)
pub async fn is_local_current(file: &Path, remote_mtime: i64) -> bool {
    match tokio::fs::metadata(file).await {
        Ok(metadata) => metadata.is_file() && mtime_millis(&metadata) >= remote_mtime,
        Err(_) => false,
    }
}

fn part_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

async fn write_stream(
    path: &Path,
    stream: &mut ByteStream,
    progress: &TaskProgress,
    abort: &CancellationToken,
) -> Result<(), TaskError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| TaskError::io(path, e))?;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(TaskError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                file.write_all(&bytes)
                    .await
                    .map_err(|e| TaskError::io(path, e))?;
                progress.add(bytes.len() as i64);
            }
            Some(Err(e)) => return Err(TaskError::io(path, e)),
            None => break,
        }
    }

    file.flush().await.map_err(|e| TaskError::io(path, e))?;
    Ok(())
}

fn set_mtime(path: &Path, mtime_ms: i64) -> std::io::Result<()> {
    let time = UNIX_EPOCH + Duration::from_millis(mtime_ms.max(0) as u64);
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(time)
}
