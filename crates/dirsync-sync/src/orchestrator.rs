//! Run orchestration
//!
//! Wires one producer, the checker pool, N consumers and the keep-alive for
//! a run, and in daemon mode also the filesystem watcher and the control
//! socket.
//!
//! ```text
//! one-shot: connect ─► verify jobs ─► producer ──poison×N──► consumers join
//!                                     ─► summary (+ mail) ─► logoff
//!
//! daemon:   connect ─► verify jobs ─► producer loop ┐
//!                                     watcher       ├─ until stop ─► shutdown-now
//!                                     control socket┘                ─► bounded wait ─► logoff
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dirsync_core::domain::Settings;
use dirsync_ipc::{ControlHandler, ControlServer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::consumer::ConsumerPool;
use crate::metrics::SyncMetrics;
use crate::queue::TaskQueue;
use crate::scanner::SyncProducer;
use crate::session::RemoteSession;
use crate::summary::{mail_summary, render_summary};
use crate::task::TaskContext;
use crate::watcher::FileWatchProducer;
use crate::SyncError;

/// Bound on the wait for background pieces after a daemon stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub uploaded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Rendered summary, as printed and mailed
    pub summary: String,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Owns the shared state of one run
pub struct Orchestrator {
    settings: Arc<Settings>,
    session: Arc<RemoteSession>,
    metrics: Arc<SyncMetrics>,
    queue: Arc<TaskQueue>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(settings: Settings, session: Arc<RemoteSession>) -> Self {
        Self {
            settings: Arc::new(settings),
            session,
            metrics: Arc::new(SyncMetrics::new()),
            queue: Arc::new(TaskQueue::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Token that stops the run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a shutdown-now of the run
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Current summary text
    pub fn status(&self) -> String {
        render_summary(&self.settings, &self.metrics.snapshot())
    }

    /// Checks that the parent namespace of every job exists remotely
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidSettings`] naming the first missing parent,
    /// or the remote error that prevented the check
    pub async fn verify_jobs(&self) -> Result<(), SyncError> {
        for job in self.settings.jobs() {
            let parent = job.parent_namespace();
            if !self.session.namespace_exists(&parent, None).await? {
                return Err(SyncError::InvalidSettings(format!(
                    "parent namespace {parent} of {} does not exist",
                    job.directory().display()
                )));
            }
        }
        Ok(())
    }

    fn context(&self) -> TaskContext {
        TaskContext {
            session: Arc::clone(&self.session),
            settings: Arc::clone(&self.settings),
            listener: self.metrics.clone(),
            queue: Arc::clone(&self.queue),
            cancel: self.cancel.clone(),
        }
    }

    /// Runs once, or until stopped in daemon mode
    ///
    /// # Errors
    /// Returns an error if the session cannot be opened, a job's parent
    /// namespace is missing, or the control socket cannot be bound. Per-file
    /// failures only show up in the report.
    pub async fn run(&self) -> Result<RunReport> {
        self.session
            .connect()
            .await
            .context("Failed to connect to the remote store")?;
        self.verify_jobs().await.context("Invalid job settings")?;

        let control = if self.settings.daemon() {
            Some(ControlServer::bind(self.settings.daemon_port()).await?)
        } else {
            None
        };

        let keep_alive_stop = self.cancel.child_token();
        let keep_alive = self.session.spawn_keep_alive(keep_alive_stop.clone());

        let ctx = self.context();
        let consumers = ConsumerPool::spawn(ctx.clone(), self.settings.workers());
        let producer = SyncProducer::new(ctx.clone(), consumers.size());

        match control {
            None => {
                info!(workers = consumers.size(), "Starting one-shot run");
                producer.run().await;
                let stats = consumers.join().await;
                info!(
                    executed = stats.executed,
                    completed = stats.completed,
                    failed = stats.failed,
                    "Consumers finished"
                );
            }
            Some(server) => self.run_daemon(ctx, producer, consumers, server).await,
        }

        keep_alive_stop.cancel();
        if let Err(e) = keep_alive.await {
            error!(error = %e, "Keep-alive task panicked");
        }

        let snapshot = self.metrics.snapshot();
        let summary = render_summary(&self.settings, &snapshot);
        if !self.settings.daemon() {
            if let Err(e) = mail_summary(&self.session, &self.settings, &summary).await {
                warn!(error = %e, "Failed to mail summary");
            }
        }
        if let Err(e) = self.session.logoff().await {
            warn!(error = %e, "Failed to close remote session");
        }

        Ok(RunReport {
            uploaded: snapshot.uploaded,
            failed: snapshot.failed,
            skipped: snapshot.skipped,
            summary,
        })
    }

    async fn run_daemon(
        &self,
        ctx: TaskContext,
        producer: SyncProducer,
        consumers: ConsumerPool,
        server: ControlServer,
    ) {
        info!(
            workers = consumers.size(),
            port = self.settings.daemon_port(),
            "Starting daemon"
        );
        let mut background: Vec<(&str, JoinHandle<()>)> = Vec::new();

        background.push(("producer", tokio::spawn(async move { producer.run().await })));

        match FileWatchProducer::new(ctx) {
            Ok(watcher) => background.push(("watcher", tokio::spawn(watcher.run()))),
            Err(e) => warn!(error = %e, "File watcher unavailable, relying on periodic scans"),
        }

        let handler = Arc::new(DaemonControl {
            settings: Arc::clone(&self.settings),
            metrics: Arc::clone(&self.metrics),
            cancel: self.cancel.clone(),
        });
        background.push((
            "control socket",
            tokio::spawn(server.run(handler, self.cancel.clone())),
        ));

        self.cancel.cancelled().await;
        info!("Daemon stopping");
        consumers.shutdown_now();

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            for (name, handle) in background {
                if let Err(e) = handle.await {
                    error!(component = name, error = %e, "Daemon component panicked");
                }
            }
            consumers.join().await
        })
        .await;
        match drained {
            Ok(stats) => info!(executed = stats.executed, "Daemon stopped"),
            Err(_) => warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Daemon components did not stop in time"
            ),
        }
    }
}

/// Control-socket view of a running daemon
struct DaemonControl {
    settings: Arc<Settings>,
    metrics: Arc<SyncMetrics>,
    cancel: CancellationToken,
}

impl ControlHandler for DaemonControl {
    fn status(&self) -> String {
        render_summary(&self.settings, &self.metrics.snapshot())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}
