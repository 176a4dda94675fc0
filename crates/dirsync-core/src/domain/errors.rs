//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including path and namespace validation, pattern compilation and
//! invalid task state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid remote namespace or asset path
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// An include or exclude pattern failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern as written in the configuration
        pattern: String,
        /// Why the pattern was rejected
        reason: String,
    },

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Path is not within the job directory it was mapped against
    #[error("Path not within job directory: {0}")]
    PathNotInJob(String),

    /// Remote path is not within the job namespace it was mapped against
    #[error("Remote path not within namespace: {0}")]
    PathNotInNamespace(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
