//! Remote listing for download jobs
//!
//! Pages through `asset.query` under the job namespace and schedules a
//! download for every asset the local tree lacks or holds an older copy of.

use dirsync_core::domain::Job;
use dirsync_core::ports::RemoteError;
use tracing::{debug, info};

use crate::task::download::is_local_current;
use crate::task::{Task, TaskContext};

/// Assets requested per `asset.query` round-trip
pub const QUERY_PAGE_SIZE: u64 = 100;

/// Schedules downloads for one job; returns how many were queued
pub async fn scan_download_job(ctx: &TaskContext, job: &Job) -> Result<usize, RemoteError> {
    let mut idx = 0;
    let mut scheduled = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let page = ctx
            .session
            .asset_query(job.namespace(), idx, QUERY_PAGE_SIZE, Some(&ctx.cancel))
            .await?;
        let fetched = page.assets.len() as u64;

        for asset in page.assets {
            if asset.content.is_none() {
                debug!(asset_path = %asset.path, "Asset has no content, not downloading");
                continue;
            }
            let Some(mtime) = asset.posix_mtime() else {
                info!(asset_path = %asset.path, "Asset has no stored mtime, not downloading");
                continue;
            };
            let file = match job.local_path_for(&asset.path) {
                Ok(file) => file,
                Err(e) => {
                    debug!(asset_path = %asset.path, error = %e, "Asset outside job namespace");
                    continue;
                }
            };
            if !job.matches(&file) || is_local_current(&file, mtime).await {
                continue;
            }
            ctx.queue.put(Task::download(asset.path, file, mtime));
            scheduled += 1;
        }

        if page.remaining == 0 || fetched == 0 {
            break;
        }
        idx += QUERY_PAGE_SIZE;
    }
    Ok(scheduled)
}
