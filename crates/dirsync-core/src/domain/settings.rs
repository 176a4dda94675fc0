//! Settings aggregate
//!
//! [`Settings`] is the runtime view of a sync run: an ordered list of
//! [`Job`]s plus every tunable the engine reads. It is built once from the
//! configuration file (see [`Settings::from_config`]) and is read-only
//! while a run is in progress; the watcher derives fresh single-job copies
//! with [`Settings::copy`] rather than mutating the shared instance.
//!
//! Numeric tunables are range-checked on assignment. An out-of-range value
//! is logged and replaced by the documented default instead of failing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use super::errors::DomainError;
use super::job::{Job, JobType};
use super::paths::{self, RemotePath};
use crate::config::Config;

/// Default number of consumer workers
pub const DEFAULT_WORKERS: usize = 1;
/// Default size of the batch checker pool
pub const DEFAULT_MAX_CHECKERS: usize = 4;
/// Upper bound of the batch checker pool
pub const MAX_CHECKERS: usize = 8;
/// Default number of files checked per remote round-trip
pub const DEFAULT_CHECK_BATCH_SIZE: usize = 100;
/// Upper bound of the check batch size
pub const MAX_CHECK_BATCH_SIZE: usize = 10_000;
/// Default control-socket port
pub const DEFAULT_DAEMON_PORT: u16 = 9761;
/// Default pause between daemon re-scans
pub const DEFAULT_DAEMON_SCAN_INTERVAL: Duration = Duration::from_millis(60_000);
/// Prefix of the engine's own log files inside the log directory
pub const LOG_FILE_PREFIX: &str = "dirsync";

/// Runtime settings for one sync run
#[derive(Debug, Clone)]
pub struct Settings {
    jobs: Vec<Job>,
    workers: usize,
    max_checkers: usize,
    check_batch_size: usize,
    daemon: bool,
    daemon_port: u16,
    daemon_scan_interval: Duration,
    csum_check: bool,
    exclude_empty_folder: bool,
    sync_local_deletion: bool,
    log_directory: Option<PathBuf>,
    notification_emails: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            workers: DEFAULT_WORKERS,
            max_checkers: DEFAULT_MAX_CHECKERS,
            check_batch_size: DEFAULT_CHECK_BATCH_SIZE,
            daemon: false,
            daemon_port: DEFAULT_DAEMON_PORT,
            daemon_scan_interval: DEFAULT_DAEMON_SCAN_INTERVAL,
            csum_check: false,
            exclude_empty_folder: false,
            sync_local_deletion: false,
            log_directory: None,
            notification_emails: Vec::new(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds settings from a loaded configuration file
    ///
    /// # Errors
    /// Returns error if a job's namespace, directory or patterns are invalid
    pub fn from_config(config: &Config) -> Result<Self, DomainError> {
        let mut settings = Self::new();
        settings.set_workers(config.sync.workers);
        settings.set_max_checkers(config.sync.max_checkers);
        settings.set_check_batch_size(config.sync.check_batch_size);
        settings.set_csum_check(config.sync.csum_check);
        settings.set_exclude_empty_folder(config.sync.exclude_empty_folder);
        settings.set_sync_local_deletion(config.sync.sync_local_deletion);
        settings.set_daemon(config.daemon.enabled);
        settings.set_daemon_port(config.daemon.port);
        settings.set_daemon_scan_interval(Duration::from_millis(config.daemon.scan_interval_ms));
        if let Some(dir) = &config.logging.directory {
            settings.set_log_directory(Some(paths::normalize_local(dir)?));
        }
        for email in &config.notification.emails {
            settings.add_notification_email(email);
        }

        for job in &config.jobs {
            let namespace = RemotePath::new(&job.namespace)?;
            settings.add_job(Job::new(
                job.job_type,
                &job.directory,
                namespace,
                job.parent,
                job.include.iter(),
                job.exclude.iter(),
            )?);
        }

        Ok(settings)
    }

    /// Copies every tunable, with or without the job list
    pub fn copy(&self, include_jobs: bool) -> Self {
        let mut copy = self.clone();
        if !include_jobs {
            copy.jobs.clear();
        }
        copy
    }

    // --- jobs ---

    /// Jobs in matching precedence order
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// Adds a job, replacing any job with the same directory and namespace
    ///
    /// The replaced job is removed from its position and the new one is
    /// appended at the end.
    pub fn add_job(&mut self, job: Job) {
        self.jobs.retain(|existing| !existing.same_identity(&job));
        self.jobs.push(job);
    }

    /// Every job that matches `path`, in order
    pub fn jobs_matching(&self, path: &Path) -> Vec<&Job> {
        self.jobs.iter().filter(|job| job.matches(path)).collect()
    }

    /// Jobs of the given direction, in order
    pub fn jobs_of_type(&self, job_type: JobType) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |job| job.job_type() == job_type)
    }

    // --- tunables ---

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn set_workers(&mut self, workers: usize) {
        if workers < 1 {
            warn!(workers, default = DEFAULT_WORKERS, "Invalid number of workers, falling back to default");
            self.workers = DEFAULT_WORKERS;
        } else {
            self.workers = workers;
        }
    }

    pub fn max_checkers(&self) -> usize {
        self.max_checkers
    }

    pub fn set_max_checkers(&mut self, max_checkers: usize) {
        if (1..=MAX_CHECKERS).contains(&max_checkers) {
            self.max_checkers = max_checkers;
        } else {
            warn!(
                max_checkers,
                default = DEFAULT_MAX_CHECKERS,
                "Invalid max checkers (expected 1..={MAX_CHECKERS}), falling back to default"
            );
            self.max_checkers = DEFAULT_MAX_CHECKERS;
        }
    }

    pub fn check_batch_size(&self) -> usize {
        self.check_batch_size
    }

    pub fn set_check_batch_size(&mut self, size: usize) {
        if (1..=MAX_CHECK_BATCH_SIZE).contains(&size) {
            self.check_batch_size = size;
        } else {
            warn!(
                size,
                default = DEFAULT_CHECK_BATCH_SIZE,
                "Invalid check batch size (expected 1..={MAX_CHECK_BATCH_SIZE}), falling back to default"
            );
            self.check_batch_size = DEFAULT_CHECK_BATCH_SIZE;
        }
    }

    pub fn daemon(&self) -> bool {
        self.daemon
    }

    pub fn set_daemon(&mut self, daemon: bool) {
        self.daemon = daemon;
    }

    pub fn daemon_port(&self) -> u16 {
        self.daemon_port
    }

    pub fn set_daemon_port(&mut self, port: u16) {
        if port == 0 {
            warn!(default = DEFAULT_DAEMON_PORT, "Invalid daemon port 0, falling back to default");
            self.daemon_port = DEFAULT_DAEMON_PORT;
        } else {
            self.daemon_port = port;
        }
    }

    pub fn daemon_scan_interval(&self) -> Duration {
        self.daemon_scan_interval
    }

    pub fn set_daemon_scan_interval(&mut self, interval: Duration) {
        if interval.is_zero() {
            warn!(
                default_ms = DEFAULT_DAEMON_SCAN_INTERVAL.as_millis() as u64,
                "Invalid daemon scan interval 0, falling back to default"
            );
            self.daemon_scan_interval = DEFAULT_DAEMON_SCAN_INTERVAL;
        } else {
            self.daemon_scan_interval = interval;
        }
    }

    pub fn csum_check(&self) -> bool {
        self.csum_check
    }

    pub fn set_csum_check(&mut self, csum_check: bool) {
        self.csum_check = csum_check;
    }

    pub fn exclude_empty_folder(&self) -> bool {
        self.exclude_empty_folder
    }

    pub fn set_exclude_empty_folder(&mut self, exclude: bool) {
        self.exclude_empty_folder = exclude;
    }

    /// Whether local deletions seen by the watcher are mirrored remotely
    pub fn sync_local_deletion(&self) -> bool {
        self.sync_local_deletion
    }

    pub fn set_sync_local_deletion(&mut self, enabled: bool) {
        self.sync_local_deletion = enabled;
    }

    pub fn log_directory(&self) -> Option<&Path> {
        self.log_directory.as_deref()
    }

    pub fn set_log_directory(&mut self, dir: Option<PathBuf>) {
        self.log_directory = dir;
    }

    pub fn notification_emails(&self) -> &[String] {
        &self.notification_emails
    }

    pub fn add_notification_email(&mut self, email: impl Into<String>) {
        let email = email.into();
        if !self.notification_emails.contains(&email) {
            self.notification_emails.push(email);
        }
    }

    pub fn has_notification_emails(&self) -> bool {
        !self.notification_emails.is_empty()
    }

    /// Returns true if `path` is one of the engine's own log files
    ///
    /// Log files are `<log_dir>/dirsync.*` ending in `.log` or `.log.lck`.
    pub fn is_log_file(&self, path: &Path) -> bool {
        let Some(log_dir) = &self.log_directory else {
            return false;
        };
        if path.parent() != Some(log_dir.as_path()) {
            return false;
        }
        path.file_name()
            .map(|n| n.to_string_lossy())
            .map(|name| {
                name.starts_with(&format!("{LOG_FILE_PREFIX}."))
                    && (name.ends_with(".log") || name.ends_with(".log.lck"))
            })
            .unwrap_or(false)
    }

    /// Structural checks that need the local filesystem
    ///
    /// Returns a human-readable message per problem; an empty vector means
    /// the settings can be used for a run.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.jobs.is_empty() {
            problems.push("no job specified".to_string());
        }
        for job in &self.jobs {
            let dir = job.directory();
            if !dir.exists() {
                problems.push(format!("directory does not exist: {}", dir.display()));
            } else if !dir.is_dir() {
                problems.push(format!("not a directory: {}", dir.display()));
            }
        }
        if self.daemon {
            if let Some(log_dir) = &self.log_directory {
                for job in &self.jobs {
                    if log_dir.starts_with(job.directory()) {
                        problems.push(format!(
                            "log directory {} must not be inside job directory {} in daemon mode",
                            log_dir.display(),
                            job.directory().display()
                        ));
                    }
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &str, ns: &str) -> Job {
        Job::upload(Path::new(dir), RemotePath::new(ns).unwrap()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.workers(), 1);
        assert_eq!(s.max_checkers(), 4);
        assert_eq!(s.check_batch_size(), 100);
        assert_eq!(s.daemon_port(), 9761);
        assert_eq!(s.daemon_scan_interval(), Duration::from_secs(60));
        assert!(!s.daemon());
        assert!(!s.csum_check());
        assert!(!s.has_jobs());
    }

    #[test]
    fn test_out_of_range_tunables_fall_back() {
        let mut s = Settings::new();
        s.set_workers(0);
        s.set_max_checkers(9);
        s.set_check_batch_size(0);
        s.set_daemon_port(0);
        s.set_daemon_scan_interval(Duration::ZERO);
        assert_eq!(s.workers(), DEFAULT_WORKERS);
        assert_eq!(s.max_checkers(), DEFAULT_MAX_CHECKERS);
        assert_eq!(s.check_batch_size(), DEFAULT_CHECK_BATCH_SIZE);
        assert_eq!(s.daemon_port(), DEFAULT_DAEMON_PORT);
        assert_eq!(s.daemon_scan_interval(), DEFAULT_DAEMON_SCAN_INTERVAL);

        s.set_check_batch_size(10_001);
        assert_eq!(s.check_batch_size(), DEFAULT_CHECK_BATCH_SIZE);
    }

    #[test]
    fn test_in_range_tunables_are_kept() {
        let mut s = Settings::new();
        s.set_workers(6);
        s.set_max_checkers(8);
        s.set_check_batch_size(10_000);
        assert_eq!(s.workers(), 6);
        assert_eq!(s.max_checkers(), 8);
        assert_eq!(s.check_batch_size(), 10_000);
    }

    #[test]
    fn test_add_job_replaces_equal_job_and_appends() {
        let mut s = Settings::new();
        s.add_job(job("/a", "/ns/a"));
        s.add_job(job("/b", "/ns/b"));
        s.add_job(job("/a", "/ns/a"));

        let dirs: Vec<_> = s.jobs().iter().map(|j| j.directory().to_path_buf()).collect();
        assert_eq!(dirs, vec![PathBuf::from("/b"), PathBuf::from("/a")]);
    }

    #[test]
    fn test_jobs_matching_returns_all_matches_in_order() {
        let mut s = Settings::new();
        s.add_job(job("/data", "/ns/one"));
        s.add_job(job("/data/sub", "/ns/two"));
        s.add_job(job("/other", "/ns/three"));

        let matched = s.jobs_matching(Path::new("/data/sub/file.txt"));
        let namespaces: Vec<_> = matched.iter().map(|j| j.namespace().as_str()).collect();
        assert_eq!(namespaces, vec!["/ns/one", "/ns/two"]);
        assert!(s.jobs_matching(Path::new("/nowhere")).is_empty());
    }

    #[test]
    fn test_copy_with_and_without_jobs() {
        let mut s = Settings::new();
        s.set_workers(3);
        s.add_job(job("/a", "/ns/a"));

        let with = s.copy(true);
        assert_eq!(with.jobs().len(), 1);
        assert_eq!(with.workers(), 3);

        let without = s.copy(false);
        assert!(without.jobs().is_empty());
        assert_eq!(without.workers(), 3);
    }

    #[test]
    fn test_is_log_file() {
        let mut s = Settings::new();
        s.set_log_directory(Some(PathBuf::from("/var/log/sync")));
        assert!(s.is_log_file(Path::new("/var/log/sync/dirsync.log")));
        assert!(s.is_log_file(Path::new("/var/log/sync/dirsync.0.log.lck")));
        assert!(!s.is_log_file(Path::new("/var/log/sync/other.log")));
        assert!(!s.is_log_file(Path::new("/var/log/sync/sub/dirsync.log")));
        assert!(!Settings::new().is_log_file(Path::new("/var/log/sync/dirsync.log")));
    }

    #[test]
    fn test_notification_emails_are_deduplicated() {
        let mut s = Settings::new();
        s.add_notification_email("a@example.com");
        s.add_notification_email("a@example.com");
        s.add_notification_email("b@example.com");
        assert_eq!(s.notification_emails().len(), 2);
    }

    #[test]
    fn test_validate_reports_missing_jobs_and_directories() {
        let s = Settings::new();
        assert_eq!(s.validate(), vec!["no job specified".to_string()]);

        let mut s = Settings::new();
        s.add_job(job("/definitely/not/here", "/ns"));
        let problems = s.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("does not exist"));
    }

    #[test]
    fn test_validate_rejects_log_dir_inside_job_in_daemon_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut s = Settings::new();
        s.add_job(Job::upload(dir.path(), RemotePath::new("/ns").unwrap()).unwrap());
        s.set_log_directory(Some(dir.path().join("logs")));
        assert!(s.validate().is_empty());

        s.set_daemon(true);
        let problems = s.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("daemon mode"));
    }
}
