//! End-to-end capture pipeline.
//!
//! For each capture request the orchestrator:
//!
//! 1. points the caller's surface at the progress view and waits for it to load
//! 2. runs a [`CaptureSession`] in a fresh cache generation, forwarding
//!    progress events to the surface
//! 3. loads the resulting archive through the [`ArchiveLoader`]
//! 4. projects the loaded archive onto the caller's surface
//!
//! Callers either bring their own surface or let the orchestrator open one
//! through a [`WindowingLayer`].
//!
//! A failure at any step is logged with its [`PipelineStage`], pushed to the
//! surface as [`SurfaceUpdate::Failed`], and stops the remaining steps.
//!
//! UI code talks to a running orchestrator through an [`OrchestratorHandle`]:
//! requests are queued on a bounded channel and handled without replying to
//! the sender.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::browser::{BrowserLauncher, HttpBrowserLauncher};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::PipelineStage;
use crate::fetcher::{HttpFetcher, ResourceFetcher};
use crate::loader::{ArchiveLoader, LoadedArchive, project};
use crate::session::{CaptureOptions, CaptureRequest, CaptureResult, CaptureSession};
use crate::storage::Directories;
use crate::profile::{BrowserProfile, Visibility};
use crate::surface::{RenderSurface, SurfaceOptions, SurfaceUpdate, WindowingLayer};
use crate::tracker::{ProgressCallback, ProgressEvent};
use crate::{Error, Result};

/// Queued requests before [`OrchestratorHandle::send`] waits.
const QUEUE_CAPACITY: usize = 32;

/// Inbound message from a UI surface.
///
/// ```rust
/// use pagestash_core::orchestrator::CaptureMessage;
///
/// let message: CaptureMessage =
///     serde_json::from_str(r#"{"type":"start-capture","url":"https://example.com"}"#)?;
/// assert_eq!(message, CaptureMessage::StartCapture { url: "https://example.com".into() });
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CaptureMessage {
    /// Capture `url` and replay it on the sending surface.
    StartCapture {
        /// Page to capture.
        url: String,
    },
}

/// Per-request overrides of the configured capture settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOverrides {
    /// Options to use instead of the configured ones.
    pub options: Option<CaptureOptions>,
    /// Directory to write the archive to instead of the stash directory.
    pub destination: Option<PathBuf>,
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// What the capture session produced.
    pub result: CaptureResult,
    /// The loaded archive now bound to the surface.
    pub archive: Arc<LoadedArchive>,
}

/// Forwards tracker progress to a surface.
struct ProgressForwarder {
    surface: Arc<dyn RenderSurface>,
}

impl ProgressForwarder {
    fn into_callback(self) -> ProgressCallback {
        Arc::new(move |event: &ProgressEvent| {
            self.surface.push(SurfaceUpdate::Progress(*event));
        })
    }
}

/// Top-level coordinator of captures.
pub struct CaptureOrchestrator {
    config: Config,
    store: CacheStore,
    launcher: Arc<dyn BrowserLauncher>,
    loader: ArchiveLoader,
    directories: Directories,
}

impl CaptureOrchestrator {
    /// Assemble an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        fetcher: Arc<dyn ResourceFetcher>,
        launcher: Arc<dyn BrowserLauncher>,
        directories: Directories,
    ) -> Self {
        let store = CacheStore::new(fetcher, &config.cache);
        let loader = ArchiveLoader::new(config.cache.max_loaded_archives);
        Self {
            config,
            store,
            launcher,
            loader,
            directories,
        }
    }

    /// Orchestrator using the built-in HTTP fetcher and browser.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let timeout = config.capture.navigation_timeout();
        let fetcher = match &config.capture.user_agent {
            Some(agent) => HttpFetcher::with_user_agent(timeout, agent)?,
            None => HttpFetcher::with_timeout(timeout)?,
        };
        let directories = Directories::from_config(&config)?;
        Ok(Self::new(
            config,
            Arc::new(fetcher),
            Arc::new(HttpBrowserLauncher::new()),
            directories,
        ))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Archive loader shared by all captures.
    #[must_use]
    pub const fn loader(&self) -> &ArchiveLoader {
        &self.loader
    }

    /// Cache generations of past captures.
    #[must_use]
    pub const fn cache_store(&self) -> &CacheStore {
        &self.store
    }

    /// Run the whole pipeline for `url` with the configured settings.
    pub async fn start_capture(
        &self,
        url: &str,
        surface: Arc<dyn RenderSurface>,
    ) -> Result<CaptureOutcome> {
        self.start_capture_with(url, surface, CaptureOverrides::default())
            .await
    }

    /// Open a new surface through `windowing` and run the pipeline on it.
    ///
    /// The surface is titled after `url` and is shown unless the configured
    /// profile modes hide the browser.
    pub async fn start_capture_in(
        &self,
        url: &str,
        windowing: &dyn WindowingLayer,
        overrides: CaptureOverrides,
    ) -> Result<CaptureOutcome> {
        let modes = overrides
            .options
            .as_ref()
            .map_or(&self.config.capture.profile_modes, |o| &o.profile_modes);
        let visible = BrowserProfile::from_modes(modes)
            .map_or(true, |profile| profile.visibility == Visibility::Visible);
        let surface = windowing.create_surface(&SurfaceOptions {
            title: url.to_string(),
            visible,
        });
        self.start_capture_with(url, surface, overrides).await
    }

    /// Run the whole pipeline for `url`, with overrides.
    pub async fn start_capture_with(
        &self,
        url: &str,
        surface: Arc<dyn RenderSurface>,
        overrides: CaptureOverrides,
    ) -> Result<CaptureOutcome> {
        match self.pipeline(url, &surface, overrides).await {
            Ok(outcome) => {
                surface.push(SurfaceUpdate::Completed {
                    archive_path: outcome.result.archive_path.clone(),
                    resource_count: outcome.result.resource_count,
                    title: outcome.result.title.clone(),
                });
                Ok(outcome)
            },
            Err(err) => {
                let stage = err.pipeline_stage().map_or("unknown", PipelineStage::as_str);
                error!(
                    stage,
                    category = err.category(),
                    url,
                    "Capture pipeline failed: {}",
                    err
                );
                surface.push(SurfaceUpdate::Failed {
                    stage: stage.to_string(),
                    message: err.root().to_string(),
                });
                Err(err)
            },
        }
    }

    async fn pipeline(
        &self,
        url: &str,
        surface: &Arc<dyn RenderSurface>,
        overrides: CaptureOverrides,
    ) -> Result<CaptureOutcome> {
        info!("Starting capture pipeline for {} on surface {}", url, surface.id());

        surface
            .load_url(&self.config.capture.progress_view_url)
            .await
            .map_err(|e| e.in_pipeline(PipelineStage::ProgressView))?;

        let result = self
            .capture(url, surface, overrides)
            .await
            .map_err(|e| e.in_pipeline(PipelineStage::Capture))?;

        let archive = self
            .loader
            .load(&result.archive_path)
            .await
            .map_err(|e| e.in_pipeline(PipelineStage::Load))?;

        let handle = archive.handle();
        if handle.document().is_none() {
            return Err(Error::ArchiveCorrupt {
                path: result.archive_path.clone(),
                reason: format!("main document {} is not in the archive", archive.manifest().document),
            }
            .in_pipeline(PipelineStage::Project));
        }
        project(&archive, surface.as_ref());

        Ok(CaptureOutcome { result, archive })
    }

    async fn capture(
        &self,
        url: &str,
        surface: &Arc<dyn RenderSurface>,
        overrides: CaptureOverrides,
    ) -> Result<CaptureResult> {
        let options = overrides
            .options
            .unwrap_or_else(|| CaptureOptions::from(&self.config.capture));
        let destination = overrides
            .destination
            .unwrap_or_else(|| self.directories.stash_dir().to_path_buf());
        let request = CaptureRequest::new(url, destination)?.with_options(options);

        let generation = self.store.begin_generation();
        let progress = ProgressForwarder {
            surface: Arc::clone(surface),
        };
        let session = CaptureSession::new(request, Arc::clone(&self.launcher), Arc::clone(&generation))
            .with_progress(progress.into_callback());

        let result = session.run().await;
        self.store.finish_generation(generation);
        result
    }

    /// Handle one inbound message. Errors are logged and reported to the surface only.
    pub async fn handle_message(&self, message: CaptureMessage, surface: Arc<dyn RenderSurface>) {
        match message {
            CaptureMessage::StartCapture { url } => {
                // Already logged and pushed to the surface.
                let _ = self.start_capture(&url, surface).await;
            },
        }
    }

    /// Start consuming queued requests on a background task.
    ///
    /// At most `capture.max_concurrent_captures` requests run at once. The
    /// task ends when every handle has been dropped and the queue is drained.
    pub fn spawn(self: Arc<Self>) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<QueuedCapture>(QUEUE_CAPACITY);
        let concurrency = self.config.capture.max_concurrent_captures.max(1);

        let task = tokio::spawn(async move {
            let queue = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|queued| (queued, rx))
            });
            queue
                .for_each_concurrent(concurrency, |queued| {
                    let this = Arc::clone(&self);
                    async move { this.handle_message(queued.message, queued.surface).await }
                })
                .await;
            info!("Capture queue closed");
        });

        (OrchestratorHandle { tx }, task)
    }
}

struct QueuedCapture {
    message: CaptureMessage,
    surface: Arc<dyn RenderSurface>,
}

/// Sending side of a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<QueuedCapture>,
}

impl OrchestratorHandle {
    /// Queue a message on behalf of `surface`.
    ///
    /// Only fails if the orchestrator has stopped; the capture's own outcome
    /// goes to the surface.
    pub async fn send(&self, message: CaptureMessage, surface: Arc<dyn RenderSurface>) -> Result<()> {
        self.tx
            .send(QueuedCapture { message, surface })
            .await
            .map_err(|_| Error::Cancelled("capture orchestrator has stopped".to_string()))
    }

    /// Parse a JSON message and queue it.
    pub async fn send_json(&self, raw: &str, surface: Arc<dyn RenderSurface>) -> Result<()> {
        let message: CaptureMessage = serde_json::from_str(raw)?;
        self.send(message, surface).await
    }
}
