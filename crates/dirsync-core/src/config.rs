//! Configuration module for dirsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//!
//! ```yaml
//! sync:
//!   workers: 2
//!   csum_check: true
//! daemon:
//!   enabled: true
//!   port: 9761
//! remote:
//!   endpoint: https://store.example.com/api
//!   token: secret
//! jobs:
//!   - directory: /data/projects
//!     namespace: /ns
//!     include: ["*.txt"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::job::JobType;
use crate::domain::paths::RemotePath;
use crate::domain::settings::{
    DEFAULT_CHECK_BATCH_SIZE, DEFAULT_DAEMON_PORT, DEFAULT_MAX_CHECKERS, DEFAULT_WORKERS,
};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for dirsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub daemon: DaemonConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
    pub notification: NotificationConfig,
    pub jobs: Vec<JobConfig>,
}

/// Pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of consumer workers executing tasks.
    pub workers: usize,
    /// Size of the batch checker pool (1-8).
    pub max_checkers: usize,
    /// Files checked per remote round-trip (1-10000).
    pub check_batch_size: usize,
    /// Verify uploaded content with CRC32.
    pub csum_check: bool,
    /// Do not create namespaces for directories.
    pub exclude_empty_folder: bool,
    /// Mirror local deletions seen by the watcher.
    pub sync_local_deletion: bool,
}

/// Daemon mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    /// Loopback port of the control socket.
    pub port: u16,
    /// Milliseconds between two full re-scans.
    pub scan_interval_ms: u64,
}

/// Remote store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the store's service endpoint.
    pub endpoint: String,
    /// Pre-issued session token. Takes precedence over user/password.
    pub token: Option<String>,
    pub domain: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Retries after a connection failure.
    pub connect_retries: u32,
    /// Milliseconds between two connection attempts.
    pub retry_interval_ms: u64,
    /// Milliseconds between two keep-alive pings.
    pub keep_alive_interval_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Directory for `dirsync.log`. Console only when absent.
    pub directory: Option<PathBuf>,
}

/// Summary mail recipients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub emails: Vec<String>,
}

/// One directory-to-namespace mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    pub directory: PathBuf,
    pub namespace: String,
    /// Treat `namespace` as the parent of `namespace/basename(directory)`.
    #[serde(default = "default_parent")]
    pub parent: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_parent() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/dirsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("dirsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_checkers: DEFAULT_MAX_CHECKERS,
            check_batch_size: DEFAULT_CHECK_BATCH_SIZE,
            csum_check: false,
            exclude_empty_folder: false,
            sync_local_deletion: false,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_DAEMON_PORT,
            scan_interval_ms: 60_000,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api".to_string(),
            token: None,
            domain: None,
            user: None,
            password: None,
            connect_retries: 5,
            retry_interval_ms: 100,
            keep_alive_interval_ms: 60_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"jobs[0].namespace"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// Out-of-range tunables are not reported here: they fall back to their
    /// defaults with a warning when settings are built. An empty vector
    /// means the configuration is usable.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- daemon ---
        if self.daemon.port == 0 {
            errors.push(ValidationError::new("daemon.port", "must be greater than 0"));
        }

        // --- remote ---
        if self.remote.endpoint.trim().is_empty() {
            errors.push(ValidationError::new("remote.endpoint", "must not be empty"));
        } else if !(self.remote.endpoint.starts_with("http://")
            || self.remote.endpoint.starts_with("https://"))
        {
            errors.push(ValidationError::new(
                "remote.endpoint",
                format!("must be an http(s) URL: {}", self.remote.endpoint),
            ));
        }
        if self.remote.token.is_none() && self.remote.user.is_some() != self.remote.password.is_some() {
            errors.push(ValidationError::new(
                "remote.user",
                "user and password must be given together",
            ));
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError::new(
                "logging.level",
                format!(
                    "invalid log level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            ));
        }

        // --- jobs ---
        if self.jobs.is_empty() {
            errors.push(ValidationError::new("jobs", "no job specified"));
        }
        for (i, job) in self.jobs.iter().enumerate() {
            let field = |name: &str| format!("jobs[{i}].{name}");

            if !job.directory.exists() {
                errors.push(ValidationError::new(
                    field("directory"),
                    format!("directory does not exist: {}", job.directory.display()),
                ));
            } else if !job.directory.is_dir() {
                errors.push(ValidationError::new(
                    field("directory"),
                    format!("not a directory: {}", job.directory.display()),
                ));
            }

            if let Err(e) = RemotePath::new(&job.namespace) {
                errors.push(ValidationError::new(field("namespace"), e.to_string()));
            }

            for pattern in job.include.iter().chain(job.exclude.iter()) {
                if let Err(e) = glob::Pattern::new(pattern) {
                    errors.push(ValidationError::new(
                        field("include"),
                        format!("invalid pattern '{pattern}': {}", e.msg),
                    ));
                }
            }

            if self.daemon.enabled {
                if let Some(log_dir) = &self.logging.directory {
                    if log_dir.starts_with(&job.directory) {
                        errors.push(ValidationError::new(
                            "logging.directory",
                            format!(
                                "must not be inside job directory {} in daemon mode",
                                job.directory.display()
                            ),
                        ));
                    }
                }
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows overriding individual fields.
///
/// ```
/// use dirsync_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .sync_workers(4)
///     .daemon_enabled(true)
///     .job("/tmp", "/ns")
///     .build();
/// assert_eq!(config.sync.workers, 4);
/// assert_eq!(config.jobs.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder pre-filled with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_workers(mut self, n: usize) -> Self {
        self.config.sync.workers = n;
        self
    }

    pub fn sync_max_checkers(mut self, n: usize) -> Self {
        self.config.sync.max_checkers = n;
        self
    }

    pub fn sync_check_batch_size(mut self, n: usize) -> Self {
        self.config.sync.check_batch_size = n;
        self
    }

    pub fn sync_csum_check(mut self, enabled: bool) -> Self {
        self.config.sync.csum_check = enabled;
        self
    }

    pub fn sync_exclude_empty_folder(mut self, enabled: bool) -> Self {
        self.config.sync.exclude_empty_folder = enabled;
        self
    }

    pub fn sync_local_deletion(mut self, enabled: bool) -> Self {
        self.config.sync.sync_local_deletion = enabled;
        self
    }

    // --- daemon ---

    pub fn daemon_enabled(mut self, enabled: bool) -> Self {
        self.config.daemon.enabled = enabled;
        self
    }

    pub fn daemon_port(mut self, port: u16) -> Self {
        self.config.daemon.port = port;
        self
    }

    pub fn daemon_scan_interval_ms(mut self, ms: u64) -> Self {
        self.config.daemon.scan_interval_ms = ms;
        self
    }

    // --- remote ---

    pub fn remote_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.remote.endpoint = endpoint.into();
        self
    }

    pub fn remote_token(mut self, token: impl Into<String>) -> Self {
        self.config.remote.token = Some(token.into());
        self
    }

    pub fn remote_credentials(
        mut self,
        domain: Option<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.remote.domain = domain;
        self.config.remote.user = Some(user.into());
        self.config.remote.password = Some(password.into());
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_directory(mut self, dir: PathBuf) -> Self {
        self.config.logging.directory = Some(dir);
        self
    }

    // --- notification ---

    pub fn notify(mut self, email: impl Into<String>) -> Self {
        self.config.notification.emails.push(email.into());
        self
    }

    // --- jobs ---

    /// Add an upload job whose namespace is used as-is.
    pub fn job(mut self, directory: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        self.config.jobs.push(JobConfig {
            job_type: JobType::Upload,
            directory: directory.into(),
            namespace: namespace.into(),
            parent: false,
            include: Vec::new(),
            exclude: Vec::new(),
        });
        self
    }

    pub fn job_config(mut self, job: JobConfig) -> Self {
        self.config.jobs.push(job);
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
