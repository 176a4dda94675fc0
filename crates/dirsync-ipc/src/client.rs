//! Control client

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::ControlCommand;

/// Upper bound for one command round-trip
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends `command` to the daemon on `127.0.0.1:port` and returns its reply
///
/// The reply is empty for `stop`.
///
/// # Errors
/// Returns an error if no daemon listens on the port, or the exchange fails
/// or times out
pub async fn send_command(port: u16, command: ControlCommand) -> Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .with_context(|| format!("No daemon listening on port {port}"))?;
        stream
            .write_all(format!("{command}\n").as_bytes())
            .await
            .context("Failed to send command")?;
        stream.shutdown().await.context("Failed to send command")?;

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .await
            .context("Failed to read reply")?;
        Ok::<_, anyhow::Error>(reply)
    };
    tokio::time::timeout(REPLY_TIMEOUT, exchange)
        .await
        .with_context(|| format!("Daemon did not answer {command} in time"))?
}
