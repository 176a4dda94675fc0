//! Soft-destroy of one asset

use std::sync::Arc;

use dirsync_core::domain::RemotePath;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TaskContext, TaskError, TaskProgress};

#[derive(Debug, Clone)]
pub struct DestroyTask {
    asset_path: RemotePath,
}

impl DestroyTask {
    pub fn new(asset_path: RemotePath) -> Self {
        Self { asset_path }
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
        progress.set_total(1);
        progress.set_operation(format!("destroying {}", self.asset_path));

        let count = ctx
            .session
            .soft_destroy(std::slice::from_ref(&self.asset_path), Some(abort))
            .await?;
        debug!(asset_path = %self.asset_path, count, "Soft-destroyed asset");
        ctx.listener.destroyed(self.asset_path.as_str());

        progress.add(1);
        Ok(())
    }
}
