//! Subcommand implementations.

pub mod clean;
pub mod pack;
pub mod start;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};
use snapcrawl_core::CrawlConfig;

/// Load and validate the config file, with environment overrides applied.
pub fn load_config(path: &Path) -> Result<CrawlConfig> {
    CrawlConfig::load(path).with_context(|| format!("Invalid configuration in {}", path.display()))
}
