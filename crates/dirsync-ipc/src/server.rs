//! Control server
//!
//! ```text
//! accept loop ──► connection task: read one line ──► status: write summary
//!      ▲                                        ├──► stop:   handler.stop(), close listener
//!      └── cancel / stop ───────────────────────┘──► other:  close
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::ControlCommand;

/// How long a client may take to send its command line
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest command line read from a client
const MAX_LINE: u64 = 256;

/// What the daemon does for each command
pub trait ControlHandler: Send + Sync {
    /// Current summary text; must not change daemon state
    fn status(&self) -> String;

    /// Starts a full shutdown of the daemon
    fn stop(&self);
}

/// Loopback listener for control commands
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    /// Binds `127.0.0.1:port`; port 0 picks a free port
    ///
    /// # Errors
    /// Returns an error if the port cannot be bound
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .with_context(|| format!("Failed to bind control socket on port {port}"))?;
        Ok(Self { listener })
    }

    /// # Errors
    /// Returns an error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read control socket address")
    }

    /// Serves connections until `cancel` fires or a client sends `stop`
    ///
    /// The listener is closed when this returns.
    pub async fn run(self, handler: Arc<dyn ControlHandler>, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Control socket listening");
        }
        let stopped = CancellationToken::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = stopped.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Control connection accepted");
                    let handler = Arc::clone(&handler);
                    let stopped = stopped.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, handler.as_ref(), &stopped).await {
                            debug!(peer = %peer, error = %e, "Control connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept control connection"),
            }
        }
        info!("Control socket closed");
    }
}

async fn serve(
    stream: TcpStream,
    handler: &dyn ControlHandler,
    stopped: &CancellationToken,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read.take(MAX_LINE));
    let mut line = String::new();
    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("Timed out waiting for a command")?
        .context("Failed to read command")?;

    match line.parse::<ControlCommand>() {
        Ok(ControlCommand::Status) => {
            let status = handler.status();
            write.write_all(status.as_bytes()).await?;
            write.shutdown().await?;
        }
        Ok(ControlCommand::Stop) => {
            info!("Stop requested over the control socket");
            stopped.cancel();
            handler.stop();
        }
        Err(e) => debug!(error = %e, "Ignoring control input"),
    }
    Ok(())
}
