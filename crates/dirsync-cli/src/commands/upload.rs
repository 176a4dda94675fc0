//! Upload command - one-shot synchronization run
//!
//! Provides the `dirsync upload` CLI command which:
//! 1. Loads the configuration file and applies command-line overrides
//! 2. Validates configuration and settings, failing before any remote call
//! 3. Opens a session and runs the orchestrator once
//! 4. Prints the summary and fails when any file could not be synchronized

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use dirsync_core::config::{Config, JobConfig};
use dirsync_core::domain::{JobType, Settings};
use dirsync_remote::HttpTransport;
use dirsync_sync::{Orchestrator, RemoteSession, SessionConfig};
use tracing::info;

use super::load_config;
use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// `DIR=NAMESPACE` pair given with `--job`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArg {
    pub directory: PathBuf,
    pub namespace: String,
}

/// Parses `DIR=NAMESPACE`; the last `=` separates the two
pub fn parse_job_arg(s: &str) -> Result<JobArg, String> {
    let (dir, ns) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected DIR=NAMESPACE, got '{s}'"))?;
    if dir.is_empty() || ns.is_empty() {
        return Err(format!("expected DIR=NAMESPACE, got '{s}'"));
    }
    Ok(JobArg {
        directory: PathBuf::from(dir),
        namespace: ns.to_string(),
    })
}

/// Upload local directories to the remote store once
#[derive(Debug, Args)]
pub struct UploadCommand {
    /// Number of consumer workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent existence checks
    #[arg(long)]
    pub max_checkers: Option<usize>,

    /// Paths per existence-check batch
    #[arg(long)]
    pub check_batch_size: Option<usize>,

    /// Verify checksums after every upload
    #[arg(long)]
    pub csum_check: bool,

    /// Do not create namespaces for directories
    #[arg(long)]
    pub exclude_empty_folder: bool,

    /// Mail the summary to this address (repeatable)
    #[arg(long = "notify", value_name = "EMAIL")]
    pub notify: Vec<String>,

    /// Upload DIR under the parent namespace NAMESPACE (repeatable)
    #[arg(long = "job", value_name = "DIR=NAMESPACE", value_parser = parse_job_arg)]
    pub jobs: Vec<JobArg>,
}

impl UploadCommand {
    /// Overlays command-line options onto the file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.workers {
            config.sync.workers = n;
        }
        if let Some(n) = self.max_checkers {
            config.sync.max_checkers = n;
        }
        if let Some(n) = self.check_batch_size {
            config.sync.check_batch_size = n;
        }
        config.sync.csum_check |= self.csum_check;
        config.sync.exclude_empty_folder |= self.exclude_empty_folder;
        config.notification.emails.extend(self.notify.iter().cloned());
        for job in &self.jobs {
            config.jobs.push(JobConfig {
                job_type: JobType::Upload,
                directory: job.directory.clone(),
                namespace: job.namespace.clone(),
                parent: true,
                include: Vec::new(),
                exclude: Vec::new(),
            });
        }
        config.daemon.enabled = false;
    }

    /// Builds one-shot settings, reporting every problem found
    fn settings(&self, config: &mut Config, formatter: &dyn OutputFormatter) -> Result<Settings> {
        self.apply(config);

        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                formatter.error(&e.to_string());
            }
            bail!("invalid configuration: {} problem(s) found", errors.len());
        }

        let settings = Settings::from_config(config).context("Invalid job configuration")?;
        let problems = settings.validate();
        if !problems.is_empty() {
            for problem in &problems {
                formatter.error(problem);
            }
            bail!("invalid settings: {} problem(s) found", problems.len());
        }
        Ok(settings)
    }

    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let mut config = load_config(config_path)?;
        let settings = self.settings(&mut config, formatter.as_ref())?;

        info!(jobs = settings.jobs().len(), "Starting upload");

        let transport = HttpTransport::from_config(&config.remote)?;
        let session = Arc::new(RemoteSession::new(
            Arc::new(transport),
            SessionConfig::from_remote(&config.remote),
        ));
        let orchestrator = Orchestrator::new(settings, session);

        let cancel = orchestrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping run");
                cancel.cancel();
            }
        });

        let report = orchestrator.run().await?;

        if format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": !report.has_failures(),
                "uploaded": report.uploaded,
                "failed": report.failed,
                "skipped": report.skipped,
                "summary": report.summary,
            }));
        } else {
            formatter.block(&report.summary);
        }

        if report.has_failures() {
            bail!("{} file(s) failed to synchronize", report.failed);
        }
        if !format.is_json() {
            formatter.success("Upload complete");
        }
        Ok(())
    }
}
