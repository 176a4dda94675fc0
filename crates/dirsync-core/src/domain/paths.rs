//! Path and namespace mapping
//!
//! Pure functions that translate between local filesystem paths and remote
//! namespace paths. Nothing here touches the filesystem except
//! [`normalize_local`], which consults the current directory when handed a
//! relative path.
//!
//! ## Mapping
//!
//! ```text
//!   job.directory = /data/projects          job.namespace = /ns/root
//!   /data/projects/b/c.txt   ──to_remote──►  /ns/root/b/c.txt
//!   /data/projects/b/c.txt   ◄──to_local───  /ns/root/b/c.txt
//! ```
//!
//! Remote paths always use forward slashes, never carry a trailing slash
//! (except the root `/`) and never contain empty, `.` or `..` segments.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// RemotePath
// ============================================================================

/// A normalized absolute path in the remote store (namespace or asset path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Parses and normalizes a remote path
    ///
    /// Backslashes are treated as separators, redundant slashes and `.`
    /// segments are dropped, and a trailing slash is removed.
    ///
    /// # Errors
    /// Returns error if the path is not absolute or contains `..`
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = path.as_ref().replace('\\', "/");
        if !raw.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {raw}"
            )));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(DomainError::InvalidRemotePath(format!(
                        "Remote path contains invalid traversal: {raw}"
                    )))
                }
                s => segments.push(s),
            }
        }

        Ok(Self(format!("/{}", segments.join("/"))))
    }

    /// The root namespace `/`
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the root namespace
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Joins a relative, slash-separated path onto this one
    ///
    /// An empty relative path yields a copy of `self`.
    ///
    /// # Errors
    /// Returns error if the relative part contains `..`
    pub fn join(&self, relative: &str) -> Result<Self, DomainError> {
        if relative.trim_matches(|c| c == '/' || c == '\\').is_empty() {
            return Ok(self.clone());
        }
        Self::new(format!("{}/{}", self.0, relative))
    }

    /// Get the parent path (`None` for the root)
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Get the last path component
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Returns the slash-separated path of `self` relative to `base`
    ///
    /// Returns `Some("")` when both are equal and `None` when `self` is not
    /// `base` or one of its descendants.
    #[must_use]
    pub fn relative_to(&self, base: &RemotePath) -> Option<String> {
        if self == base {
            return Some(String::new());
        }
        if base.is_root() {
            return Some(self.0[1..].to_string());
        }
        self.0
            .strip_prefix(base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }

    /// Returns true if `self` equals `base` or lies below it
    #[must_use]
    pub fn is_or_is_descendant_of(&self, base: &RemotePath) -> bool {
        self.relative_to(base).is_some()
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

// ============================================================================
// Local path helpers
// ============================================================================

/// Makes `path` absolute and lexically normalized
///
/// `.` components are dropped, `..` pops the previous component and any
/// trailing separator disappears. Symlinks are not resolved.
///
/// # Errors
/// Returns error if `path` is relative and the current directory is unavailable
pub fn normalize_local(path: &Path) -> Result<PathBuf, DomainError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| DomainError::InvalidPath(format!("{}: {e}", path.display())))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    Ok(normalized)
}

/// Returns `path` relative to `base` as a forward-slash string
///
/// Returns `Some("")` when both are equal and `None` when `path` is not
/// inside `base` or a component below `base` is not valid UTF-8.
#[must_use]
pub fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(base).ok()?;
    let mut segments = Vec::new();
    for component in rest.components() {
        if let Component::Normal(name) = component {
            segments.push(name.to_str()?);
        }
    }
    Some(segments.join("/"))
}

/// Maps a local path under `directory` to its remote path under `namespace`
///
/// # Errors
/// Returns error if `local` is not `directory` or one of its descendants
pub fn to_remote_path(
    directory: &Path,
    namespace: &RemotePath,
    local: &Path,
) -> Result<RemotePath, DomainError> {
    let local = normalize_local(local)?;
    let Some(relative) = relative_path(directory, &local) else {
        if local.starts_with(directory) {
            return Err(DomainError::InvalidPath(format!(
                "not valid UTF-8: {}",
                local.display()
            )));
        }
        return Err(DomainError::PathNotInJob(local.display().to_string()));
    };
    namespace.join(&relative)
}

/// Maps a remote path under `namespace` back to a local path under `directory`
///
/// # Errors
/// Returns error if `remote` is not `namespace` or one of its descendants
pub fn to_local_path(
    directory: &Path,
    namespace: &RemotePath,
    remote: &RemotePath,
) -> Result<PathBuf, DomainError> {
    let relative = remote
        .relative_to(namespace)
        .ok_or_else(|| DomainError::PathNotInNamespace(remote.to_string()))?;

    let mut local = directory.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        local.push(segment);
    }
    Ok(local)
}
