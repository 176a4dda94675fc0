//! dirsync daemon - continuous directory synchronization
//!
//! Loads the configuration, opens a session on the remote store and runs
//! the orchestrator in daemon mode: periodic re-scans, the filesystem
//! watcher and the control socket (`dirsync daemon status|stop`).
//!
//! The daemon exits on `stop`, SIGINT or SIGTERM. Invalid configuration is
//! reported before any work starts and ends the process with a non-zero
//! exit code.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dirsync_core::config::{Config, LoggingConfig};
use dirsync_core::domain::settings::LOG_FILE_PREFIX;
use dirsync_core::domain::Settings;
use dirsync_remote::HttpTransport;
use dirsync_sync::{Orchestrator, RemoteSession, SessionConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dirsyncd", version, about = "dirsync background synchronization daemon")]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

// ============================================================================
// Logging
// ============================================================================

fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("{LOG_FILE_PREFIX}.log"))
}

/// Installs stderr logging, plus a plain-text file under the log directory
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = log_file_path(dir);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .init();
    Ok(())
}

// ============================================================================
// Startup
// ============================================================================

/// Builds daemon-mode settings, failing on anything that cannot be run
fn load_settings(config: &Config) -> Result<Settings> {
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!(field = %e.field, "{}", e.message);
        }
        bail!("invalid configuration: {} problem(s) found", errors.len());
    }

    let mut settings = Settings::from_config(config).context("Invalid job configuration")?;
    settings.set_daemon(true);

    let problems = settings.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("{problem}");
        }
        bail!("invalid settings: {} problem(s) found", problems.len());
    }
    Ok(settings)
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    init_logging(&config.logging)?;
    info!(config = %config_path.display(), "dirsync daemon starting (dirsyncd)");

    let settings = load_settings(&config)?;
    let transport = HttpTransport::from_config(&config.remote)?;
    let session = Arc::new(RemoteSession::new(
        Arc::new(transport),
        SessionConfig::from_remote(&config.remote),
    ));

    let orchestrator = Orchestrator::new(settings, session);
    tokio::spawn(shutdown_signal(orchestrator.cancel_token()));

    match orchestrator.run().await {
        Ok(report) => {
            info!(
                uploaded = report.uploaded,
                failed = report.failed,
                skipped = report.skipped,
                "dirsync daemon shut down gracefully"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "dirsync daemon exiting with error");
            Err(e)
        }
    }
}
