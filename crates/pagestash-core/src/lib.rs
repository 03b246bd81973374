//! # pagestash-core
//!
//! Core functionality for pagestash - capture a live web page into a single
//! archive file and replay it later without the network.
//!
//! ## Architecture
//!
//! The capture pipeline is built from a handful of components, leaves first:
//!
//! - **Resource cache** ([`cache`]): intercepts every fetch during a capture,
//!   with at most one network call in flight per request key
//! - **Browser profiles** ([`profile`]): immutable launch configurations
//! - **Pending request tracker** ([`tracker`]): progress events and
//!   network-idle detection
//! - **Capture session** ([`session`]): launch, navigate, wait for idle,
//!   package
//! - **Archive loader** ([`loader`]): indexes archives and projects them onto
//!   rendering surfaces
//! - **Orchestrator** ([`orchestrator`]): sequences the whole pipeline per
//!   request
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagestash_core::{CaptureOrchestrator, Config, HeadlessSurface};
//!
//! # async fn run() -> pagestash_core::Result<()> {
//! let orchestrator = CaptureOrchestrator::from_config(Config::load()?)?;
//! let surface = Arc::new(HeadlessSurface::new("main"));
//!
//! let outcome = orchestrator.start_capture("https://example.com/", surface).await?;
//! println!(
//!     "Captured {} resources to {}",
//!     outcome.result.resource_count,
//!     outcome.result.archive_path.display()
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`]. Fatal errors carry the stage
//! they happened in:
//!
//! ```rust
//! use pagestash_core::{CaptureStage, Error};
//!
//! let err = Error::Timeout("network never went idle".into()).in_stage(CaptureStage::Capturing);
//! assert_eq!(err.stage(), Some(CaptureStage::Capturing));
//! assert!(matches!(err.root(), Error::Timeout(_)));
//! ```

/// Archive file format
pub mod archive;
/// Browser collaborator interface and built-in HTTP browser
pub mod browser;
/// Intercepting resource cache
pub mod cache;
/// Configuration management
pub mod config;
/// Error types and result aliases
pub mod error;
/// Network fetch backend
pub mod fetcher;
/// Archive loading and projection
pub mod loader;
/// End-to-end capture pipeline
pub mod orchestrator;
/// Browser launch profiles
pub mod profile;
/// Request identity and cached resources
pub mod resource;
/// Capture session state machine
pub mod session;
/// Local filesystem locations
pub mod storage;
/// Rendering surfaces
pub mod surface;
/// Pending request tracking
pub mod tracker;

// Re-export commonly used types
pub use archive::{ARCHIVE_EXTENSION, ArchiveManifest, ArchiveReader, ArchiveWriter, CommitGate, WrittenArchive};
pub use browser::{BrowserInstance, BrowserLauncher, HttpBrowserLauncher, NetworkInterceptor};
pub use cache::{CacheStore, ResourceCache};
pub use config::{CacheConfig, CaptureConfig, Config, PathsConfig};
pub use error::{CaptureStage, Error, PipelineStage, Result};
pub use fetcher::{HttpFetcher, ResourceFetcher};
pub use loader::{ArchiveHandle, ArchiveLoader, LoadedArchive, project};
pub use orchestrator::{CaptureMessage, CaptureOrchestrator, CaptureOutcome, OrchestratorHandle};
pub use profile::BrowserProfile;
pub use resource::{CachedResource, ResourceKey, ResourceRequest};
pub use session::{CaptureOptions, CaptureRequest, CaptureResult, CaptureSession, SessionState};
pub use storage::Directories;
pub use surface::{HeadlessSurface, HeadlessWindowing, RenderSurface, SurfaceOptions, SurfaceUpdate, WindowingLayer};
pub use tracker::{PendingRequestTracker, ProgressEvent, TrackerState};
