//! Error types and handling for pagestash-core operations.
//!
//! A single [`Error`] enum covers every failure in the capture pipeline. The
//! variants follow the pipeline's own taxonomy so callers can tell a failed
//! browser launch from a corrupt archive without string matching.
//!
//! ## Error Categories
//!
//! - **Launch**: the browser instance could not be started
//! - **Navigation**: the target URL was invalid or unreachable
//! - **Resource fetch**: a single subresource failed (non-fatal to a capture)
//! - **Packaging**: the archive could not be written (fatal to a capture)
//! - **Archive corrupt**: an archive could not be unpacked or indexed
//! - **Configuration**: unknown profile modes, malformed config files
//! - **Ambient**: I/O, network, serialization, timeouts and cancellation
//!
//! ## Stage Context
//!
//! Fatal capture errors always carry the [`CaptureStage`] they happened in,
//! either inherently (a [`Error::Packaging`] is always a packaging failure) or
//! through [`Error::Stage`]. The orchestrator adds one more layer with
//! [`Error::Pipeline`]:
//!
//! ```rust
//! use pagestash_core::{CaptureStage, Error};
//!
//! let err = Error::Timeout("no network idle after 120s".to_string())
//!     .in_stage(CaptureStage::Capturing);
//! assert_eq!(err.stage(), Some(CaptureStage::Capturing));
//! assert!(matches!(err.root(), Error::Timeout(_)));
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle stage of a single capture session.
///
/// Used to attach context to fatal failures so the orchestrator can log which
/// part of the capture went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStage {
    /// Starting the browser instance.
    Launching,
    /// Loading the main document.
    Navigating,
    /// Waiting for the page's network activity to settle.
    Capturing,
    /// Writing the archive.
    Packaging,
}

impl CaptureStage {
    /// Stable lowercase name for logs and payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Launching => "launching",
            Self::Navigating => "navigating",
            Self::Capturing => "capturing",
            Self::Packaging => "packaging",
        }
    }
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of the end-to-end orchestration (progress view, capture, load, projection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Binding the progress view to the caller's surface.
    ProgressView,
    /// Running the capture session.
    Capture,
    /// Loading the produced archive.
    Load,
    /// Projecting the loaded archive onto the surface.
    Project,
}

impl PipelineStage {
    /// Stable lowercase name for logs and payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProgressView => "progress_view",
            Self::Capture => "capture",
            Self::Load => "load",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for pagestash-core operations.
///
/// All fallible public functions return `Result<T, Error>`. The source chain
/// is preserved for wrapped errors so `Debug` output shows the full story.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client failure that is not tied to a specific resource.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The browser instance failed to start.
    #[error("Browser launch failed: {0}")]
    Launch(String),

    /// The target URL was invalid or could not be loaded.
    ///
    /// ## Common Causes
    ///
    /// - Unreachable host or DNS failure
    /// - Non-success status for the main document
    /// - Navigation timed out
    #[error("Navigation to '{url}' failed: {reason}")]
    Navigation {
        /// URL the browser was navigating to.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// A single resource could not be fetched.
    ///
    /// Absorbed by the capture session: the resource is logged and left out of
    /// the archive. Never cached, so the next request for the same key retries.
    #[error("Fetch of '{key}' failed: {reason}")]
    ResourceFetch {
        /// Normalized request identity.
        key: String,
        /// What went wrong.
        reason: String,
        /// HTTP status, when the server answered.
        status: Option<u16>,
    },

    /// The archive could not be written.
    #[error("Packaging failed: {0}")]
    Packaging(String),

    /// The archive could not be opened, unpacked or indexed.
    #[error("Archive '{}' is corrupt: {reason}", path.display())]
    ArchiveCorrupt {
        /// Path of the archive on disk.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Unknown profile mode, malformed config file or invalid option.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// URL is malformed or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A configured limit (bytes, resource count) was exceeded.
    #[error("Resource limited: {0}")]
    ResourceLimited(String),

    /// Operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation was cancelled through its cancellation token.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The browser instance died while a capture was running.
    #[error("Browser crashed: {0}")]
    BrowserCrashed(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A capture failure annotated with the stage it happened in.
    #[error("Capture failed while {stage}: {source}")]
    Stage {
        /// Stage of the capture session.
        stage: CaptureStage,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// An orchestration failure annotated with the pipeline stage.
    #[error("Pipeline stage '{stage}' failed: {source}")]
    Pipeline {
        /// Stage of the orchestration.
        stage: PipelineStage,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Attach capture stage context, unless the error already carries a stage.
    #[must_use]
    pub fn in_stage(self, stage: CaptureStage) -> Self {
        if self.stage().is_some() {
            return self;
        }
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Attach orchestration stage context.
    #[must_use]
    pub fn in_pipeline(self, stage: PipelineStage) -> Self {
        Self::Pipeline {
            stage,
            source: Box::new(self),
        }
    }

    /// Capture stage this error belongs to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<CaptureStage> {
        match self {
            Self::Launch(_) => Some(CaptureStage::Launching),
            Self::Navigation { .. } => Some(CaptureStage::Navigating),
            Self::Packaging(_) => Some(CaptureStage::Packaging),
            Self::Stage { stage, .. } => Some(*stage),
            Self::Pipeline { source, .. } => source.stage(),
            _ => None,
        }
    }

    /// Orchestration stage this error belongs to, if any.
    #[must_use]
    pub const fn pipeline_stage(&self) -> Option<PipelineStage> {
        match self {
            Self::Pipeline { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error, with all stage wrappers removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } | Self::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if the error might be recoverable through retry logic.
    ///
    /// Resource-level fetch failures, timeouts and transient I/O or connection
    /// problems are recoverable; configuration, packaging and corruption
    /// failures are not.
    ///
    /// ```rust
    /// use pagestash_core::Error;
    ///
    /// assert!(Error::Timeout("slow".into()).is_recoverable());
    /// assert!(!Error::Configuration("unknown mode".into()).is_recoverable());
    /// ```
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::ResourceFetch { .. } | Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            Self::Stage { source, .. } | Self::Pipeline { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Get the error category as a string identifier for structured logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self.root() {
            Self::Io(_) => "io",
            Self::Network(_) => "network",
            Self::Launch(_) => "launch",
            Self::Navigation { .. } => "navigation",
            Self::ResourceFetch { .. } => "resource_fetch",
            Self::Packaging(_) => "packaging",
            Self::ArchiveCorrupt { .. } => "archive_corrupt",
            Self::Configuration(_) => "configuration",
            Self::InvalidUrl(_) => "invalid_url",
            Self::ResourceLimited(_) => "resource_limited",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::BrowserCrashed(_) => "browser_crashed",
            Self::Serialization(_) => "serialization",
            Self::Stage { .. } | Self::Pipeline { .. } => "other",
        }
    }
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
