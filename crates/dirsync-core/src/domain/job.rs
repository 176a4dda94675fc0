//! Job entity
//!
//! A [`Job`] binds one local directory to one remote namespace, optionally
//! narrowed by include and exclude patterns.
//!
//! ## Matching
//!
//! A path is matched by a job iff
//! 1. it is the job directory or one of its descendants, and
//! 2. there are no include patterns or the relative path matches one, and
//! 3. there are no exclude patterns or the relative path matches none.
//!
//! Excludes therefore win over includes. Patterns are shell-style globs
//! (`*`, `?`, `[..]`, `**`) evaluated against the forward-slash path
//! relative to the job directory; `*` also crosses `/`.

use std::fmt;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::paths::{self, RemotePath};

/// Direction of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Local directory is pushed to the remote namespace
    #[default]
    Upload,
    /// Remote namespace is pulled into the local directory
    Download,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Upload => write!(f, "upload"),
            JobType::Download => write!(f, "download"),
        }
    }
}

// ============================================================================
// PatternSet
// ============================================================================

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// An ordered, de-duplicated set of compiled glob patterns
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compiles every pattern, dropping duplicates while keeping first-seen order
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidPattern`] for the first pattern that fails to compile
    pub fn new<I, S>(patterns: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled: Vec<Pattern> = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref();
            if compiled.iter().any(|p| p.as_str() == raw) {
                continue;
            }
            let pattern = Pattern::new(raw).map_err(|e| DomainError::InvalidPattern {
                pattern: raw.to_string(),
                reason: e.msg.to_string(),
            })?;
            compiled.push(pattern);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if any pattern matches `relative`
    pub fn matches_any(&self, relative: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }

    /// The patterns as originally written
    pub fn as_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.as_str().to_string()).collect()
    }
}

// ============================================================================
// Job
// ============================================================================

/// One directory-to-namespace mapping
///
/// Two jobs are equal iff their directory and effective namespace are equal;
/// patterns and type do not take part in identity.
#[derive(Debug, Clone)]
pub struct Job {
    job_type: JobType,
    directory: PathBuf,
    namespace: RemotePath,
    includes: PatternSet,
    excludes: PatternSet,
}

impl Job {
    /// Creates a job, canonicalizing the directory
    ///
    /// When `parent_namespace` is true, `namespace` is treated as the parent
    /// and the effective namespace becomes `namespace/basename(directory)`.
    ///
    /// # Errors
    /// Returns error if the directory has no final component while
    /// `parent_namespace` is set, or if a pattern fails to compile
    pub fn new<I, S>(
        job_type: JobType,
        directory: &Path,
        namespace: RemotePath,
        parent_namespace: bool,
        includes: I,
        excludes: I,
    ) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let directory = paths::normalize_local(directory)?;
        let namespace = if parent_namespace {
            let name = directory
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    DomainError::InvalidPath(format!(
                        "{} has no name to append to the parent namespace",
                        directory.display()
                    ))
                })?;
            namespace.join(&name)?
        } else {
            namespace
        };

        Ok(Self {
            job_type,
            directory,
            namespace,
            includes: PatternSet::new(includes)?,
            excludes: PatternSet::new(excludes)?,
        })
    }

    /// Convenience constructor for an upload job without patterns
    ///
    /// # Errors
    /// See [`Job::new`]
    pub fn upload(directory: &Path, namespace: RemotePath) -> Result<Self, DomainError> {
        Self::new(
            JobType::Upload,
            directory,
            namespace,
            false,
            Vec::<String>::new(),
            Vec::new(),
        )
    }

    /// Returns a copy of this job rooted at a sub-directory
    ///
    /// The derived job keeps type and patterns but points at the mapped
    /// `namespace` of `directory`. Used when a directory appears under a
    /// watched job.
    ///
    /// # Errors
    /// Returns error if `directory` is outside this job
    pub fn rebased(&self, directory: &Path) -> Result<Self, DomainError> {
        let directory = paths::normalize_local(directory)?;
        let namespace = self.remote_path_for(&directory)?;
        Ok(Self {
            job_type: self.job_type,
            directory,
            namespace,
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
        })
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Absolute, normalized local directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Effective remote namespace
    pub fn namespace(&self) -> &RemotePath {
        &self.namespace
    }

    /// Parent of the effective namespace (the namespace itself for the root)
    pub fn parent_namespace(&self) -> RemotePath {
        self.namespace
            .parent()
            .unwrap_or_else(|| self.namespace.clone())
    }

    pub fn includes(&self) -> &PatternSet {
        &self.includes
    }

    pub fn excludes(&self) -> &PatternSet {
        &self.excludes
    }

    /// Returns true if `path` belongs to this job (see module docs)
    pub fn matches(&self, path: &Path) -> bool {
        let Ok(path) = paths::normalize_local(path) else {
            return false;
        };
        let Some(relative) = paths::relative_path(&self.directory, &path) else {
            return false;
        };
        if relative.is_empty() {
            return true;
        }

        if !self.includes.is_empty() && !self.includes.matches_any(&relative) {
            return false;
        }
        !(!self.excludes.is_empty() && self.excludes.matches_any(&relative))
    }

    /// Maps a local path of this job to its remote path
    ///
    /// # Errors
    /// Returns error if `local` is outside the job directory
    pub fn remote_path_for(&self, local: &Path) -> Result<RemotePath, DomainError> {
        paths::to_remote_path(&self.directory, &self.namespace, local)
    }

    /// Maps a remote path of this job back to its local path
    ///
    /// # Errors
    /// Returns error if `remote` is outside the job namespace
    pub fn local_path_for(&self, remote: &RemotePath) -> Result<PathBuf, DomainError> {
        paths::to_local_path(&self.directory, &self.namespace, remote)
    }

    /// Identity comparison on (directory, namespace)
    pub fn same_identity(&self, other: &Job) -> bool {
        self.directory == other.directory && self.namespace == other.namespace
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
    }
}

impl Eq for Job {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> RemotePath {
        RemotePath::new(s).unwrap()
    }

    fn job(includes: &[&str], excludes: &[&str]) -> Job {
        Job::new(
            JobType::Upload,
            Path::new("/data/projects"),
            ns("/ns/root"),
            false,
            includes.to_vec(),
            excludes.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_parent_namespace_appends_basename() {
        let job = Job::new(
            JobType::Upload,
            Path::new("/data/projects/"),
            ns("/ns"),
            true,
            Vec::<&str>::new(),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(job.namespace().as_str(), "/ns/projects");
        assert_eq!(job.parent_namespace().as_str(), "/ns");
        assert_eq!(job.directory(), Path::new("/data/projects"));
    }

    #[test]
    fn test_parent_namespace_rejects_root_directory() {
        let err = Job::new(
            JobType::Upload,
            Path::new("/"),
            ns("/ns"),
            true,
            Vec::<&str>::new(),
            Vec::new(),
        );
        assert!(matches!(err, Err(DomainError::InvalidPath(_))));
    }

    #[test]
    fn test_matches_without_patterns() {
        let job = job(&[], &[]);
        assert!(job.matches(Path::new("/data/projects")));
        assert!(job.matches(Path::new("/data/projects/a.txt")));
        assert!(job.matches(Path::new("/data/projects/b/c.txt")));
        assert!(!job.matches(Path::new("/data/other/a.txt")));
        assert!(!job.matches(Path::new("/data/projects-old/a.txt")));
    }

    #[test]
    fn test_matches_include_only() {
        let job = job(&["*.txt"], &[]);
        assert!(job.matches(Path::new("/data/projects/a.txt")));
        assert!(job.matches(Path::new("/data/projects/b/c.txt")));
        assert!(!job.matches(Path::new("/data/projects/a.bin")));
    }

    #[test]
    fn test_matches_exclude_only() {
        let job = job(&[], &["tmp/**", "*.swp"]);
        assert!(job.matches(Path::new("/data/projects/a.txt")));
        assert!(!job.matches(Path::new("/data/projects/tmp/x.txt")));
        assert!(!job.matches(Path::new("/data/projects/doc/.a.swp")));
    }

    #[test]
    fn test_exclude_takes_precedence_over_include() {
        let job = job(&["*.txt"], &["secret.txt"]);
        assert!(job.matches(Path::new("/data/projects/public.txt")));
        assert!(!job.matches(Path::new("/data/projects/secret.txt")));
    }

    #[test]
    fn test_job_directory_always_matches_itself() {
        let job = job(&["*.txt"], &["*"]);
        assert!(job.matches(Path::new("/data/projects")));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = Job::new(
            JobType::Upload,
            Path::new("/data"),
            ns("/ns"),
            false,
            vec!["[unclosed"],
            vec![],
        );
        assert!(matches!(err, Err(DomainError::InvalidPattern { .. })));
    }

    #[test]
    fn test_duplicate_patterns_are_collapsed() {
        let set = PatternSet::new(["*.txt", "*.txt", "*.md"]).unwrap();
        assert_eq!(set.as_strings(), vec!["*.txt", "*.md"]);
    }

    #[test]
    fn test_identity_ignores_patterns() {
        let a = job(&["*.txt"], &[]);
        let b = job(&[], &["*.bin"]);
        assert_eq!(a, b);

        let c = Job::upload(Path::new("/data/projects"), ns("/ns/other")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_rebased_keeps_patterns() {
        let job = job(&["*.txt"], &["skip.txt"]);
        let sub = job.rebased(Path::new("/data/projects/b")).unwrap();
        assert_eq!(sub.directory(), Path::new("/data/projects/b"));
        assert_eq!(sub.namespace().as_str(), "/ns/root/b");
        assert!(sub.matches(Path::new("/data/projects/b/c.txt")));
        assert!(!sub.matches(Path::new("/data/projects/b/skip.txt")));
        assert!(job.rebased(Path::new("/elsewhere")).is_err());
    }

    #[test]
    fn test_path_mapping_helpers() {
        let job = job(&[], &[]);
        let remote = job
            .remote_path_for(Path::new("/data/projects/b/c.txt"))
            .unwrap();
        assert_eq!(remote.as_str(), "/ns/root/b/c.txt");
        assert_eq!(
            job.local_path_for(&remote).unwrap(),
            PathBuf::from("/data/projects/b/c.txt")
        );
    }
}
