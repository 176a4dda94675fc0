//! Remote store port (driven/secondary port)
//!
//! The remote store is reached through a single abstract RPC: a named
//! service, structured JSON arguments, an optional upload byte stream and an
//! optional download stream, returning a structured JSON result.
//!
//! ## Design Notes
//!
//! - Requests carry their upload stream by value, so a request can only be
//!   sent once. Callers that retry rebuild the request for every attempt.
//! - Failures are classified by [`RemoteError`]: connection failures are
//!   retryable, session-invalid failures call for one re-authentication,
//!   everything else is final.
//! - Dropping the future returned by [`RemoteTransport::call`] aborts the
//!   in-flight call.

use std::fmt;
use std::io;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Service names
// ============================================================================

/// Wire names of the services the engine uses
pub mod services {
    pub const NAMESPACE_EXISTS: &str = "namespace.exists";
    pub const NAMESPACE_CREATE: &str = "namespace.create";
    pub const ASSET_EXISTS: &str = "asset.exists";
    pub const ASSET_GET: &str = "asset.get";
    pub const ASSET_CREATE: &str = "asset.create";
    pub const ASSET_SET: &str = "asset.set";
    pub const ASSET_SOFT_DESTROY: &str = "asset.soft.destroy";
    pub const ASSET_SOFT_UNDESTROY: &str = "asset.soft.undestroy";
    pub const ASSET_QUERY: &str = "asset.query";
    pub const SERVER_PING: &str = "server.ping";
    pub const MAIL_SEND: &str = "mail.send";
}

// ============================================================================
// Streams
// ============================================================================

/// A boxed stream of byte chunks
pub type ByteStream = BoxStream<'static, io::Result<Vec<u8>>>;

/// Content uploaded with a request
pub struct ServiceInput {
    /// Total number of bytes the stream yields
    pub length: u64,
    pub stream: ByteStream,
}

impl fmt::Debug for ServiceInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInput")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Content downloaded with a response
pub struct ServiceOutput {
    /// Content length when the store announced one
    pub length: Option<u64>,
    pub stream: ByteStream,
}

impl fmt::Debug for ServiceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceOutput")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Request / response
// ============================================================================

/// One call to the remote store
#[derive(Debug)]
pub struct ServiceRequest {
    pub service: String,
    pub args: Value,
    pub input: Option<ServiceInput>,
    /// Ask the store to stream content back instead of a JSON result
    pub want_output: bool,
}

impl ServiceRequest {
    pub fn new(service: impl Into<String>, args: Value) -> Self {
        Self {
            service: service.into(),
            args,
            input: None,
            want_output: false,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: ServiceInput) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn with_output(mut self) -> Self {
        self.want_output = true;
        self
    }
}

/// The store's answer to a [`ServiceRequest`]
#[derive(Debug, Default)]
pub struct ServiceResponse {
    pub result: Value,
    pub output: Option<ServiceOutput>,
}

impl ServiceResponse {
    pub fn json(result: Value) -> Self {
        Self {
            result,
            output: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure of a remote call
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The store could not be reached or the connection dropped
    #[error("connection failed: {0}")]
    Connection(String),

    /// The session token is no longer accepted
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// The store executed the service and refused it
    #[error("{service} rejected: {message}")]
    Rejected { service: String, message: String },

    /// The call was aborted locally
    #[error("call aborted")]
    Aborted,

    /// The store answered with something that could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn rejected(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Connection failures may succeed when tried again
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }

    pub fn is_session_invalid(&self) -> bool {
        matches!(self, RemoteError::SessionInvalid(_))
    }

    /// The store's error text for rejected calls
    pub fn message(&self) -> Option<&str> {
        match self {
            RemoteError::Rejected { message, .. } => Some(message),
            _ => None,
        }
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Transport to the remote store
///
/// Implementations must be safe to call from many tasks at once; every call
/// is independent and carries the current session credentials.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// (Re-)establishes the session with the cached credentials
    async fn authenticate(&self) -> Result<(), RemoteError>;

    /// Executes one service call
    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, RemoteError>;

    /// Discards the session on the store side
    async fn logoff(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}
