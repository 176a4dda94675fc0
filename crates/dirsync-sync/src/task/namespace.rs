//! Namespace creation
//!
//! Creation is idempotent: an existing namespace is left alone, and a
//! creation that loses a race ("already exists") or hits a namespace the
//! session cannot see ("not accessible") counts as success.

use std::sync::Arc;

use dirsync_core::domain::RemotePath;
use dirsync_core::ports::RemoteError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TaskContext, TaskError, TaskProgress};

#[derive(Debug, Clone)]
pub struct NamespaceCreateTask {
    namespace: RemotePath,
}

impl NamespaceCreateTask {
    pub fn new(namespace: RemotePath) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &RemotePath {
        &self.namespace
    }

    pub(crate) async fn run(
        &mut self,
        ctx: &TaskContext,
        progress: &Arc<TaskProgress>,
        abort: &CancellationToken,
    ) -> Result<(), TaskError> {
        progress.set_total(1);
        progress.set_operation(format!("creating namespace {}", self.namespace));

        if ctx.session.namespace_exists(&self.namespace, Some(abort)).await? {
            debug!(namespace = %self.namespace, "Namespace already exists");
        } else {
            match ctx.session.namespace_create(&self.namespace, Some(abort)).await {
                Ok(()) => debug!(namespace = %self.namespace, "Created namespace"),
                Err(err) if is_benign(&err) => {
                    debug!(namespace = %self.namespace, error = %err, "Namespace creation raced, ignoring");
                }
                Err(err) => return Err(err.into()),
            }
        }

        progress.add(1);
        Ok(())
    }
}

fn is_benign(err: &RemoteError) -> bool {
    err.message().is_some_and(|message| {
        let message = message.to_ascii_lowercase();
        message.contains("already exists") || message.contains("not accessible")
    })
}
