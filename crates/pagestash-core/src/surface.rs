//! Rendering surfaces and the windowing layer that hosts them.
//!
//! A rendering surface is whatever the caller displays pages in: a browser
//! window, a terminal progress view, or a recording stub in tests. The
//! orchestrator points it at a progress view, pushes [`SurfaceUpdate`]s while
//! a capture runs, and finally binds the loaded archive to it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::Result;
use crate::loader::ArchiveHandle;
use crate::tracker::ProgressEvent;

/// Message pushed to a surface. No acknowledgment is expected.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"progress","pendingCount":3,...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SurfaceUpdate {
    /// Live request counts.
    Progress(ProgressEvent),
    /// The capture pipeline stopped.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Pipeline stage that failed.
        stage: String,
        /// Human-readable reason.
        message: String,
    },
    /// The archive was written and loaded.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Archive location.
        archive_path: PathBuf,
        /// Resources in the archive.
        resource_count: usize,
        /// Captured page title.
        title: Option<String>,
    },
}

impl SurfaceUpdate {
    /// Whether this update ends a capture.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Completed { .. })
    }
}

/// A displayable context provided by the host.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    /// Stable identifier, for logging.
    fn id(&self) -> &str;

    /// Load `url` and return once the surface has finished loading it.
    async fn load_url(&self, url: &str) -> Result<()>;

    /// Push an update to whatever the surface is showing.
    fn push(&self, update: SurfaceUpdate);

    /// Resolve this surface's resources from `archive` instead of the network.
    fn bind_archive(&self, archive: ArchiveHandle);
}

/// Options for a new surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceOptions {
    /// Window title.
    pub title: String,
    /// Whether the surface is shown.
    pub visible: bool,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            title: "pagestash".to_string(),
            visible: true,
        }
    }
}

/// Creates rendering surfaces.
pub trait WindowingLayer: Send + Sync {
    /// Create a surface.
    fn create_surface(&self, options: &SurfaceOptions) -> Arc<dyn RenderSurface>;
}

#[derive(Default)]
struct Recorded {
    loaded_urls: Vec<String>,
    updates: Vec<SurfaceUpdate>,
    archive: Option<ArchiveHandle>,
}

/// A surface that renders nothing and records everything it is asked to do.
///
/// Used by non-interactive callers and tests.
pub struct HeadlessSurface {
    id: String,
    options: Option<SurfaceOptions>,
    recorded: Mutex<Recorded>,
    finished: watch::Sender<bool>,
}

impl HeadlessSurface {
    /// Create a surface with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id: id.into(),
            options: None,
            recorded: Mutex::new(Recorded::default()),
            finished,
        }
    }

    /// Options the windowing layer created this surface with.
    #[must_use]
    pub const fn options(&self) -> Option<&SurfaceOptions> {
        self.options.as_ref()
    }

    /// URLs loaded so far, in order.
    #[must_use]
    pub fn loaded_urls(&self) -> Vec<String> {
        self.recorded.lock().loaded_urls.clone()
    }

    /// Updates pushed so far, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<SurfaceUpdate> {
        self.recorded.lock().updates.clone()
    }

    /// Archive bound to this surface, if any.
    #[must_use]
    pub fn bound_archive(&self) -> Option<ArchiveHandle> {
        self.recorded.lock().archive.clone()
    }

    /// Wait until a terminal update has been pushed.
    pub async fn wait_until_finished(&self) {
        let mut finished = self.finished.subscribe();
        // Sender lives in `self`, so this only ends when the flag flips.
        let _ = finished.wait_for(|done| *done).await;
    }
}

#[async_trait]
impl RenderSurface for HeadlessSurface {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_url(&self, url: &str) -> Result<()> {
        self.recorded.lock().loaded_urls.push(url.to_string());
        Ok(())
    }

    fn push(&self, update: SurfaceUpdate) {
        let terminal = update.is_terminal();
        self.recorded.lock().updates.push(update);
        if terminal {
            self.finished.send_replace(true);
        }
    }

    fn bind_archive(&self, archive: ArchiveHandle) {
        self.recorded.lock().archive = Some(archive);
    }
}

/// Windowing layer producing [`HeadlessSurface`]s.
#[derive(Default)]
pub struct HeadlessWindowing {
    created: Mutex<Vec<Arc<HeadlessSurface>>>,
}

impl HeadlessWindowing {
    /// Create an empty windowing layer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Surfaces created so far.
    #[must_use]
    pub fn surfaces(&self) -> Vec<Arc<HeadlessSurface>> {
        self.created.lock().clone()
    }
}

impl WindowingLayer for HeadlessWindowing {
    fn create_surface(&self, options: &SurfaceOptions) -> Arc<dyn RenderSurface> {
        let mut created = self.created.lock();
        let mut surface =
            HeadlessSurface::new(format!("{}-{}", options.title, created.len() + 1));
        surface.options = Some(options.clone());
        let surface = Arc::new(surface);
        created.push(Arc::clone(&surface));
        surface
    }
}
