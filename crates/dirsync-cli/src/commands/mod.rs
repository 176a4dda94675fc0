//! CLI subcommands

pub mod config;
pub mod daemon;
pub mod upload;

use std::path::Path;

use anyhow::{Context, Result};
use dirsync_core::config::Config;

/// Loads the configuration file, or defaults when it does not exist
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}
