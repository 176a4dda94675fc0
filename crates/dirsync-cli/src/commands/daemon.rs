//! Daemon control commands
//!
//! `dirsync daemon status|stop` talk to a running `dirsyncd` over its
//! loopback control socket and print whatever it writes back.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use dirsync_core::config::Config;
use dirsync_core::domain::settings::DEFAULT_DAEMON_PORT;
use dirsync_ipc::{send_command, ControlCommand};
use tracing::info;

use super::load_config;
use crate::output::{get_formatter, OutputFormat};

// ============================================================================
// DaemonCommand
// ============================================================================

/// Control a running dirsync daemon
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Print the daemon's current summary
    Status {
        /// Control port (defaults to the configured daemon port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Shut the daemon down
    Stop {
        /// Control port (defaults to the configured daemon port)
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Port from the flag, else the configuration, else the default
fn resolve_port(flag: Option<u16>, config: Option<&Config>) -> u16 {
    flag.filter(|p| *p != 0)
        .or_else(|| config.map(|c| c.daemon.port).filter(|p| *p != 0))
        .unwrap_or(DEFAULT_DAEMON_PORT)
}

impl DaemonCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let (command, flag) = match self {
            DaemonCommand::Status { port } => (ControlCommand::Status, *port),
            DaemonCommand::Stop { port } => (ControlCommand::Stop, *port),
        };
        let config = if flag.is_some() {
            None
        } else {
            load_config(config_path).ok()
        };
        let port = resolve_port(flag, config.as_ref());
        send(command, port, format).await
    }
}

// ============================================================================
// daemon status / stop
// ============================================================================

async fn send(command: ControlCommand, port: u16, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    info!(command = %command, port, "Sending control command");

    let reply = send_command(port, command)
        .await
        .with_context(|| format!("Is the daemon running on port {port}?"))?;

    if format.is_json() {
        formatter.print_json(&serde_json::json!({
            "command": command.as_str(),
            "port": port,
            "success": true,
            "reply": reply,
        }));
        return Ok(());
    }

    match command {
        ControlCommand::Status => formatter.block(&reply),
        ControlCommand::Stop => formatter.success("Stop requested"),
    }
    Ok(())
}
