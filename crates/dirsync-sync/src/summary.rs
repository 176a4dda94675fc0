//! Human-readable run summary
//!
//! The same text is printed at the end of a one-shot run, returned by the
//! daemon's `status` command and mailed to the notification addresses.

use std::fmt::Write;

use dirsync_core::domain::Settings;
use dirsync_core::ports::RemoteError;
use tracing::info;

use crate::metrics::MetricsSnapshot;
use crate::session::RemoteSession;

/// Subject line of the summary mail
pub const MAIL_SUBJECT: &str = "DIRSYNC Summary";

const ACTIVITY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Renders the settings block
pub fn render_settings(settings: &Settings) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_settings(&mut out, settings);
    out
}

fn write_settings(out: &mut String, settings: &Settings) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(out, "Settings:")?;
    for job in settings.jobs() {
        writeln!(out, "    src-directory: {}", job.directory().display())?;
        for include in job.includes().as_strings() {
            writeln!(out, "        include: {include}")?;
        }
        for exclude in job.excludes().as_strings() {
            writeln!(out, "        exclude: {exclude}")?;
        }
        writeln!(out, "    dst-namespace: {}", job.namespace())?;
        writeln!(out)?;
    }
    writeln!(out, "    number-of-workers: {}", settings.workers())?;
    writeln!(out, "    daemon: {}", settings.daemon())?;
    if settings.daemon() {
        writeln!(out, "    daemon-port: {}", settings.daemon_port())?;
    }
    writeln!(out, "    csum-check: {}", settings.csum_check())?;
    writeln!(out, "    exclude-empty-folder: {}", settings.exclude_empty_folder())?;
    match settings.log_directory() {
        Some(dir) => writeln!(out, "    log-directory: {}", dir.display())?,
        None => writeln!(out, "    log-directory: none")?,
    }
    if settings.has_notification_emails() {
        writeln!(out, "    notification:")?;
        for email in settings.notification_emails() {
            writeln!(out, "        mail: {email}")?;
        }
    }
    Ok(())
}

/// Renders the settings block followed by the run totals
pub fn render_summary(settings: &Settings, snapshot: &MetricsSnapshot) -> String {
    let mut out = render_settings(settings);
    let _ = write_totals(&mut out, snapshot, settings.daemon());
    out
}

fn write_totals(out: &mut String, m: &MetricsSnapshot, daemon: bool) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(out, "Summary:")?;
    writeln!(out, "    number-of-uploaded-files: {:>16}", m.uploaded)?;
    writeln!(out, "      number-of-failed-files: {:>16}", m.failed)?;
    writeln!(out, "     number-of-skipped-files: {:>16}", m.skipped)?;
    writeln!(out, "       total-processed-files: {:>16}", m.processed())?;
    writeln!(out, "        total-uploaded-bytes: {:>16} bytes", m.uploaded_bytes)?;
    if !daemon {
        writeln!(out, "                upload-speed: {:>16.3} MB/s", upload_speed(m))?;
    }
    writeln!(out)?;

    if !m.recent_activities.is_empty() {
        writeln!(out, "    Recent activities:")?;
        for activity in &m.recent_activities {
            writeln!(
                out,
                "        {}: uploading '{}'",
                activity.at.format(ACTIVITY_TIME_FORMAT),
                activity.file.display()
            )?;
        }
    }
    writeln!(out)?;

    if !m.failed_files.is_empty() {
        writeln!(out, "    Failed files:")?;
        for file in &m.failed_files {
            writeln!(out, "        {}", file.display())?;
        }
        if m.failed_files_truncated() {
            writeln!(out, "        ... ... ...")?;
        }
    }
    Ok(())
}

/// Upload throughput in MB/s (10^6 bytes)
fn upload_speed(m: &MetricsSnapshot) -> f64 {
    let secs = m.elapsed.as_secs_f64();
    if m.uploaded_bytes <= 0 || secs <= 0.0 {
        return 0.0;
    }
    (m.uploaded_bytes as f64 / 1_000_000.0) / secs
}

/// Mails `body` to the notification addresses, if any
pub async fn mail_summary(
    session: &RemoteSession,
    settings: &Settings,
    body: &str,
) -> Result<(), RemoteError> {
    if !settings.has_notification_emails() {
        return Ok(());
    }
    let from = format!("dirsync@{}", session.config().server_host);
    session
        .send_mail(&from, settings.notification_emails(), MAIL_SUBJECT, body)
        .await?;
    info!(
        recipients = settings.notification_emails().len(),
        "Summary mailed"
    );
    Ok(())
}
