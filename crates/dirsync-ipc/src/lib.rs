//! dirsync IPC - daemon control socket
//!
//! A running daemon listens on a loopback TCP port and reads one line per
//! connection:
//!
//! - `status` - the daemon writes its current summary and keeps running
//! - `stop` - the daemon shuts down; nothing is written back
//!
//! Any other input closes the connection without action.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::send_command;
pub use protocol::{ControlCommand, ParseCommandError};
pub use server::{ControlHandler, ControlServer};
