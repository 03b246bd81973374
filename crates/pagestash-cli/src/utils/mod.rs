//! Shared CLI helpers.

pub mod logging;

use std::path::Path;

use anyhow::{Context, Result};
use pagestash_core::Config;

pub use logging::initialize_logging;

/// Load configuration from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Config::load().context("Failed to load configuration"),
    }
}
