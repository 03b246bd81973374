//! Configuration management for pagestash.
//!
//! Configuration is a single TOML document. Every section has defaults, so a
//! missing file (or a file that only sets a few keys) is fine; a malformed file
//! is a [`Error::Configuration`].
//!
//! ## File Location
//!
//! - Linux: `~/.config/pagestash/global.toml`
//! - macOS: `~/Library/Application Support/dev.pagestash.pagestash/global.toml`
//! - Windows: `%APPDATA%\pagestash\pagestash\config\global.toml`
//!
//! `PAGESTASH_CONFIG_DIR` overrides the directory.
//!
//! ## Example Configuration File
//!
//! ```toml
//! [capture]
//! quiet_period_ms = 500
//! capture_timeout_secs = 120
//! navigation_timeout_secs = 30
//! max_concurrent_fetches = 8
//! max_concurrent_captures = 1
//! prefer_amp = true
//! profile_modes = ["hidden", "default"]
//!
//! [cache]
//! max_generation_bytes = 268435456
//! retained_generations = 4
//!
//! [paths]
//! root = "/home/user/.pagestash"
//! ```
//!
//! ```rust
//! use pagestash_core::Config;
//!
//! let config: Config = toml::from_str("[capture]\nquiet_period_ms = 250\n")?;
//! assert_eq!(config.capture.quiet_period_ms, 250);
//! assert_eq!(config.capture.capture_timeout_secs, 120);
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::profile::BrowserProfile;
use crate::storage::Directories;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the global configuration file.
pub const CONFIG_FILE_NAME: &str = "global.toml";

/// Global configuration for pagestash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture pipeline settings
    pub capture: CaptureConfig,
    /// Resource cache and archive loader settings
    pub cache: CacheConfig,
    /// File system paths
    pub paths: PathsConfig,
}

/// Settings for the capture session and network-idle detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// How long the network must stay idle, after the first drain, before the
    /// capture is considered complete.
    pub quiet_period_ms: u64,

    /// Upper bound for a whole capture (launch to packaging).
    pub capture_timeout_secs: u64,

    /// Upper bound for loading the main document.
    pub navigation_timeout_secs: u64,

    /// Subresource fetches the built-in browser runs concurrently.
    pub max_concurrent_fetches: usize,

    /// Capture requests the orchestrator runs at the same time.
    pub max_concurrent_captures: usize,

    /// Capture the AMP variant of a page when the document advertises one.
    pub prefer_amp: bool,

    /// Profile transforms applied to the default browser profile, in order.
    pub profile_modes: Vec<String>,

    /// URL the caller's surface is pointed at while a capture runs.
    pub progress_view_url: String,

    /// User agent the built-in browser sends.
    pub user_agent: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 500,
            capture_timeout_secs: 120,
            navigation_timeout_secs: 30,
            max_concurrent_fetches: 8,
            max_concurrent_captures: 1,
            prefer_amp: true,
            profile_modes: vec!["hidden".to_string(), "default".to_string()],
            progress_view_url: "pagestash://capture/progress".to_string(),
            user_agent: None,
        }
    }
}

impl CaptureConfig {
    /// Quiet period as a `Duration`.
    #[must_use]
    pub const fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    /// Capture timeout as a `Duration`.
    #[must_use]
    pub const fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// Navigation timeout as a `Duration`.
    #[must_use]
    pub const fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

/// Limits for cache generations and loaded archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Payload bytes a single capture may store.
    pub max_generation_bytes: usize,
    /// Resources a single capture may store.
    pub max_generation_entries: usize,
    /// Finished capture generations kept in memory.
    pub retained_generations: usize,
    /// Loaded archives kept in memory by the archive loader.
    pub max_loaded_archives: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_generation_bytes: 256 * 1024 * 1024,
            max_generation_entries: 2_000,
            retained_generations: 4,
            max_loaded_archives: 16,
        }
    }
}

/// File system paths configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory for all pagestash data. Archives go to `<root>/stash`.
    pub root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: Directories::default_data_root(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, or defaults if no file exists.
    pub fn load() -> Result<Self> {
        let config_path = Directories::default_config_dir()?.join(CONFIG_FILE_NAME);
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit file, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to an explicit file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Configuration(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;

        fs::write(path, content)
            .map_err(|e| Error::Configuration(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Check value ranges and profile modes.
    ///
    /// Runs before any browser work, so a bad config never launches anything.
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.quiet_period_ms == 0 {
            return Err(Error::Configuration(
                "capture.quiet_period_ms must be greater than zero".into(),
            ));
        }
        if capture.capture_timeout_secs == 0 || capture.navigation_timeout_secs == 0 {
            return Err(Error::Configuration(
                "capture timeouts must be greater than zero".into(),
            ));
        }
        if capture.max_concurrent_fetches == 0 || capture.max_concurrent_captures == 0 {
            return Err(Error::Configuration(
                "capture concurrency limits must be greater than zero".into(),
            ));
        }
        BrowserProfile::from_modes(&capture.profile_modes)?;

        if self.cache.max_generation_entries == 0 || self.cache.max_generation_bytes == 0 {
            return Err(Error::Configuration(
                "cache generation limits must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Directory captured archives are written to.
    #[must_use]
    pub fn stash_dir(&self) -> PathBuf {
        self.paths.root.join("stash")
    }
}
