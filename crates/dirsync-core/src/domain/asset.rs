//! Remote asset metadata and local POSIX attributes
//!
//! [`AssetMetadata`] is what the store reports for an asset: identity,
//! soft-deleted flag, content description and the POSIX attributes that
//! were mirrored onto it at upload time. [`PosixAttributes`] is read from
//! the local filesystem and compared against the stored copy to decide
//! whether a file is stale.
//!
//! Timestamps are milliseconds since the Unix epoch throughout.

use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use super::paths::RemotePath;

/// Content descriptor of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    /// Content length in bytes
    pub size: u64,
    /// CRC32 of the content, when the store computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csum: Option<u32>,
}

/// POSIX attributes mirrored onto an asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixAttributes {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Status change time (ms)
    pub ctime: i64,
    /// Modification time (ms)
    pub mtime: i64,
    /// Target of a symbolic link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<String>,
}

impl PosixAttributes {
    /// Reads the attributes of `path` without following symlinks
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        let symlink = if metadata.file_type().is_symlink() {
            Some(std::fs::read_link(path)?.to_string_lossy().into_owned())
        } else {
            None
        };
        let mut attrs = Self::from_metadata(&metadata);
        attrs.symlink = symlink;
        Ok(attrs)
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode(),
            ctime: metadata.ctime() * 1000 + metadata.ctime_nsec() / 1_000_000,
            mtime: mtime_millis(metadata),
            symlink: None,
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mtime = mtime_millis(metadata);
        Self {
            uid: 0,
            gid: 0,
            mode: if metadata.permissions().readonly() { 0o444 } else { 0o644 },
            ctime: mtime,
            mtime,
            symlink: None,
        }
    }
}

/// Modification time of `metadata` in milliseconds since the epoch
///
/// Times before the epoch or unavailable on the platform map to 0.
pub fn mtime_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Metadata of a remote asset as reported by `asset.get`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub id: String,
    pub path: RemotePath,
    /// Soft-destroyed; can be restored with an undestroy
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix: Option<PosixAttributes>,
}

impl AssetMetadata {
    pub fn content_size(&self) -> Option<u64> {
        self.content.map(|c| c.size)
    }

    pub fn content_csum(&self) -> Option<u32> {
        self.content.and_then(|c| c.csum)
    }

    pub fn posix_mtime(&self) -> Option<i64> {
        self.posix.as_ref().map(|p| p.mtime)
    }

    /// Returns true if the stored copy is older than or differs in size from
    /// a local file of `local_size` bytes modified at `local_mtime`
    ///
    /// An asset without content is always stale. An asset without a stored
    /// mtime is only compared by size.
    pub fn is_stale(&self, local_size: u64, local_mtime: i64) -> bool {
        match self.content {
            None => true,
            Some(content) if content.size != local_size => true,
            Some(_) => self.posix_mtime().is_some_and(|remote| remote < local_mtime),
        }
    }
}
