//! dirsync Sync - directory-to-remote-store synchronization engine
//!
//! Provides:
//! - A remote session with connect-retry, one re-authentication and keep-alive
//! - A closed set of tasks (namespace-create, upload, download, destroy,
//!   batch-check, poison) executed through a common state machine
//! - A producer/checker/consumer pipeline fed by a tree scanner, a remote
//!   scanner for download jobs and a filesystem watcher
//! - The orchestrator that wires everything for one-shot and daemon runs
//!
//! ## Data flow
//!
//! ```text
//! TreeScanner ──batches──► CheckerPool ──► TaskQueue ──► ConsumerPool ──► RemoteSession
//!      │                                      ▲
//!      └──────── namespace-create ────────────┤
//! FileWatchProducer ─────── uploads/destroys ─┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] - retrying remote session and keep-alive
//! - [`service`] - typed wrappers over the store's services
//! - [`task`] - task model and executors
//! - [`queue`] - FIFO handoff between producers and consumers
//! - [`scanner`] - tree walk, checker pool and the producer loop
//! - [`remote_scan`] - paged listing of download jobs
//! - [`watcher`] - filesystem change producer
//! - [`consumer`] - worker pool draining the queue
//! - [`metrics`] - run totals, recent activities and failed files
//! - [`summary`] - human-readable run summary and mail notification
//! - [`orchestrator`] - run wiring, daemon mode and the control socket

pub mod consumer;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod remote_scan;
pub mod scanner;
pub mod service;
pub mod session;
pub mod summary;
pub mod task;
pub mod watcher;

use thiserror::Error;

pub use orchestrator::{Orchestrator, RunReport};
pub use session::{RemoteSession, SessionConfig};

/// Engine-level failures that abort a run
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote store could not be used
    #[error("Remote error: {0}")]
    RemoteError(#[from] dirsync_core::ports::RemoteError),

    /// The settings cannot be run
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}
