//! Port definitions
//!
//! Ports are the interfaces the engine depends on but whose implementations
//! live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`RemoteTransport`] - RPC access to the remote asset store

pub mod remote_store;

pub use remote_store::{
    services, ByteStream, RemoteError, RemoteTransport, ServiceInput, ServiceOutput,
    ServiceRequest, ServiceResponse,
};
