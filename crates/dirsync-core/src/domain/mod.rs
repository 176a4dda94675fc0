//! Domain entities and business logic
//!
//! This module contains the core domain types for dirsync:
//! - Path and namespace mapping
//! - Jobs and their include/exclude patterns
//! - The `Settings` aggregate
//! - Remote asset metadata and local POSIX attributes
//! - Task lifecycle states
//! - Domain-specific error types

pub mod asset;
pub mod errors;
pub mod job;
pub mod paths;
pub mod settings;
pub mod task;

// Re-export commonly used types
pub use asset::{AssetMetadata, ContentInfo, PosixAttributes};
pub use errors::DomainError;
pub use job::{Job, JobType, PatternSet};
pub use paths::RemotePath;
pub use settings::Settings;
pub use task::TaskState;
