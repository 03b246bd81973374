//! One capture, from browser launch to archive on disk.
//!
//! ```text
//! Created → Launching → Navigating → Capturing → Packaging → Completed
//!                \            \            \            \
//!                 └────────────┴────────────┴────────────┴──→ Failed(stage)
//! ```
//!
//! A [`CaptureSession`] owns its pending request tracker and writes into one
//! cache generation. Resource-level failures are logged and left out of the
//! archive; everything else fails the session with the stage attached.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::archive::{ArchiveManifest, ArchiveWriter, CaptureMetadata, CommitGate};
use crate::browser::{BrowserInstance, BrowserLauncher, Navigation, NavigationOptions, NetworkInterceptor};
use crate::cache::ResourceCache;
use crate::config::CaptureConfig;
use crate::error::CaptureStage;
use crate::profile::BrowserProfile;
use crate::tracker::{PendingRequestTracker, ProgressCallback};
use crate::{Error, Result};

/// Tunables for a single capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Capture the AMP variant when the page advertises one.
    pub prefer_amp: bool,
    /// Idle time required after the first drain.
    pub quiet_period: Duration,
    /// Upper bound for the whole session.
    pub capture_timeout: Duration,
    /// Upper bound for the main document load.
    pub navigation_timeout: Duration,
    /// Profile transforms applied to the default profile, in order.
    pub profile_modes: Vec<String>,
    /// Concurrent subresource fetches.
    pub max_concurrent_fetches: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for CaptureOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            prefer_amp: config.prefer_amp,
            quiet_period: config.quiet_period(),
            capture_timeout: config.capture_timeout(),
            navigation_timeout: config.navigation_timeout(),
            profile_modes: config.profile_modes.clone(),
            max_concurrent_fetches: config.max_concurrent_fetches,
        }
    }
}

/// What to capture and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Page to capture.
    pub target_url: Url,
    /// Directory the archive is written to.
    pub destination_directory: PathBuf,
    /// Capture tunables.
    pub options: CaptureOptions,
}

impl CaptureRequest {
    /// Build a request with default options. Only `http` and `https` URLs are accepted.
    pub fn new(target_url: &str, destination_directory: impl Into<PathBuf>) -> Result<Self> {
        let url = Url::parse(target_url.trim())
            .map_err(|e| Error::InvalidUrl(format!("{target_url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!(
                "{target_url}: unsupported scheme '{}'",
                url.scheme()
            )));
        }
        Ok(Self {
            target_url: url,
            destination_directory: destination_directory.into(),
            options: CaptureOptions::default(),
        })
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, not yet run.
    Created,
    /// Starting the browser.
    Launching,
    /// Loading the main document.
    Navigating,
    /// Waiting for the network to go quiet.
    Capturing,
    /// Writing the archive.
    Packaging,
    /// Archive written.
    Completed,
    /// Aborted in the given stage.
    Failed(CaptureStage),
}

impl SessionState {
    /// Stage this state belongs to, for failure attribution.
    #[must_use]
    pub const fn stage(self) -> Option<CaptureStage> {
        match self {
            Self::Created | Self::Launching => Some(CaptureStage::Launching),
            Self::Navigating => Some(CaptureStage::Navigating),
            Self::Capturing => Some(CaptureStage::Capturing),
            Self::Packaging => Some(CaptureStage::Packaging),
            Self::Failed(stage) => Some(stage),
            Self::Completed => None,
        }
    }

    /// Whether the session has finished, successfully or not.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Launching => f.write_str("launching"),
            Self::Navigating => f.write_str("navigating"),
            Self::Capturing => f.write_str("capturing"),
            Self::Packaging => f.write_str("packaging"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(stage) => write!(f, "failed while {stage}"),
        }
    }
}

/// Instants of the session milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTimeline {
    /// Session start.
    pub started: Instant,
    /// First Active→Idle transition after navigation began.
    pub first_idle: Instant,
    /// Completion policy satisfied.
    pub network_complete: Instant,
    /// Packaging began.
    pub packaging_started: Instant,
}

/// Outcome of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    /// Where the archive was written.
    pub archive_path: PathBuf,
    /// Resources stored in the archive.
    pub resource_count: usize,
    /// Resources that failed and were left out.
    pub failed_count: usize,
    /// Launch to archive written.
    pub duration_ms: u64,
    /// URL that was requested.
    pub source_url: Url,
    /// URL of the captured document.
    pub final_url: Url,
    /// Document title.
    pub title: Option<String>,
    /// Cache generation the session wrote into.
    pub generation: u64,
    /// Milestones.
    pub timeline: CaptureTimeline,
}

/// Drives one capture.
pub struct CaptureSession {
    request: CaptureRequest,
    launcher: Arc<dyn BrowserLauncher>,
    cache: Arc<ResourceCache>,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl CaptureSession {
    /// Create a session that launches browsers through `launcher` and stores
    /// resources in `cache`.
    #[must_use]
    pub fn new(
        request: CaptureRequest,
        launcher: Arc<dyn BrowserLauncher>,
        cache: Arc<ResourceCache>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            request,
            launcher,
            cache,
            progress: None,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Forward tracker progress events to `callback`.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Token that cancels this session.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The request being captured.
    #[must_use]
    pub const fn request(&self) -> &CaptureRequest {
        &self.request
    }

    fn transition(&self, next: SessionState) {
        debug!(url = %self.request.target_url, state = %next, "capture session state");
        self.state.send_replace(next);
    }

    /// Run the capture to completion.
    ///
    /// The profile modes are validated before anything is launched, so an
    /// unknown mode fails with [`Error::Configuration`] without side effects.
    /// A session that fails, times out, is cancelled or is dropped leaves no
    /// archive behind, even if packaging had already written one.
    pub async fn run(&self) -> Result<CaptureResult> {
        let started = Instant::now();
        let started_at = Utc::now();

        let profile = match BrowserProfile::from_modes(&self.request.options.profile_modes) {
            Ok(profile) => profile,
            Err(err) => {
                self.transition(SessionState::Failed(CaptureStage::Launching));
                return Err(err);
            },
        };

        info!("Starting capture of {}", self.request.target_url);
        let work = self.cancel.child_token();
        let timeout = self.request.options.capture_timeout;
        let gate = CommitGate::new();
        let keep_archive = gate.abort_on_drop();

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled("capture cancelled".to_string())),
            outcome = tokio::time::timeout(timeout, self.drive(&profile, (started, started_at), &work, &gate)) => {
                outcome.unwrap_or_else(|_| Err(Error::Timeout(format!(
                    "capture did not finish within {}s",
                    timeout.as_secs()
                ))))
            },
        };
        work.cancel();

        match outcome {
            Ok(result) => {
                keep_archive.disarm();
                self.transition(SessionState::Completed);
                info!(
                    "Captured {} ({} resources, {} failed) to {} in {}ms",
                    result.final_url,
                    result.resource_count,
                    result.failed_count,
                    result.archive_path.display(),
                    result.duration_ms
                );
                Ok(result)
            },
            Err(err) => {
                let stage = err
                    .stage()
                    .or_else(|| self.state().stage())
                    .unwrap_or(CaptureStage::Launching);
                self.transition(SessionState::Failed(stage));
                Err(err.in_stage(stage))
            },
        }
    }

    async fn drive(
        &self,
        profile: &BrowserProfile,
        (started, started_at): (Instant, DateTime<Utc>),
        cancel: &CancellationToken,
        gate: &CommitGate,
    ) -> Result<CaptureResult> {
        let options = &self.request.options;

        self.transition(SessionState::Launching);
        let mut browser = self.launcher.launch(profile).await.map_err(|err| match err {
            Error::Launch(_) => err,
            other => Error::Launch(other.to_string()),
        })?;

        self.transition(SessionState::Navigating);
        let mut tracker = PendingRequestTracker::new();
        if let Some(progress) = &self.progress {
            tracker = tracker.with_progress(Arc::clone(progress));
        }
        let tracker = Arc::new(tracker);
        let interceptor =
            NetworkInterceptor::new(Arc::clone(&self.cache), Arc::clone(&tracker), cancel.clone());

        let navigation = match self.navigate(browser.as_mut(), &interceptor).await {
            Ok(navigation) => navigation,
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    debug!("Error closing browser after failed navigation: {}", close_err);
                }
                return Err(err.in_stage(CaptureStage::Navigating));
            },
        };

        self.transition(SessionState::Capturing);
        let report = tracker.wait_for_completion(options.quiet_period).await;
        debug!(
            drains = report.drains,
            requests = report.dispatched,
            "network complete"
        );
        browser
            .close()
            .await
            .map_err(|err| err.in_stage(CaptureStage::Capturing))?;

        self.transition(SessionState::Packaging);
        let timeline = CaptureTimeline {
            started,
            first_idle: report.first_drain_at,
            network_complete: report.completed_at,
            packaging_started: Instant::now(),
        };
        self.package(profile, &navigation, &interceptor, started_at, timeline, gate)
            .await
            .map_err(|err| match err {
                Error::Packaging(_) | Error::Cancelled(_) => err,
                other => Error::Packaging(other.to_string()),
            })
    }

    async fn navigate(
        &self,
        browser: &mut dyn BrowserInstance,
        interceptor: &NetworkInterceptor,
    ) -> Result<Navigation> {
        let options = &self.request.options;
        let url = &self.request.target_url;
        let navigation_options = NavigationOptions {
            prefer_amp: options.prefer_amp,
            max_concurrent_fetches: options.max_concurrent_fetches,
        };

        match tokio::time::timeout(
            options.navigation_timeout,
            browser.navigate(url, interceptor, &navigation_options),
        )
        .await
        {
            Ok(navigation) => navigation,
            Err(_) => Err(Error::Navigation {
                url: url.to_string(),
                reason: format!(
                    "timed out after {}s",
                    options.navigation_timeout.as_secs()
                ),
            }),
        }
    }

    async fn package(
        &self,
        profile: &BrowserProfile,
        navigation: &Navigation,
        interceptor: &NetworkInterceptor,
        started_at: DateTime<Utc>,
        timeline: CaptureTimeline,
        gate: &CommitGate,
    ) -> Result<CaptureResult> {
        let destination = &self.request.destination_directory;
        tokio::fs::create_dir_all(destination).await?;

        let resources = self.cache.snapshot();
        let failures = interceptor.failures();
        if resources.iter().all(|r| r.key != navigation.document) {
            warn!("Main document {} is missing from the cache", navigation.document);
        }

        let stem = derive_archive_stem(navigation.title.as_deref(), &navigation.final_url);
        let manifest = ArchiveManifest::build(
            CaptureMetadata {
                source_url: navigation.requested_url.to_string(),
                final_url: navigation.final_url.to_string(),
                title: navigation.title.clone(),
                document: navigation.document.clone(),
                profile: profile.name.clone(),
                captured_at: started_at,
                duration_ms: elapsed_ms(timeline.started),
                failures: failures.clone(),
            },
            &resources,
        );

        let writer = ArchiveWriter::unique_in(destination, stem).with_gate(gate.clone());
        let resource_count = resources.len();
        let written = tokio::task::spawn_blocking(move || writer.write(&manifest, &resources))
            .await
            .map_err(|e| Error::Packaging(format!("archive writer task failed: {e}")))??;

        Ok(CaptureResult {
            archive_path: written.path,
            resource_count,
            failed_count: failures.len(),
            duration_ms: elapsed_ms(timeline.started),
            source_url: navigation.requested_url.clone(),
            final_url: navigation.final_url.clone(),
            title: navigation.title.clone(),
            generation: self.cache.generation(),
            timeline,
        })
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// File stem for an archive: the page title, or host and path when untitled.
#[must_use]
pub fn derive_archive_stem(title: Option<&str>, url: &Url) -> String {
    if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    let host = url.host_str().unwrap_or("capture");
    let path = url.path().trim_matches('/');
    if path.is_empty() {
        host.to_string()
    } else {
        format!("{host}_{}", path.replace('/', "_"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::browser::{HttpBrowserLauncher, InFlightRequest};
    use crate::cache::GenerationLimits;
    use crate::fetcher::{FetchedResource, ResourceFetcher};
    use crate::resource::ResourceRequest;
    use crate::tracker::ProgressEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves a fixed set of pages; everything else is a 404.
    #[derive(Default)]
    struct SiteFetcher {
        pages: HashMap<String, (&'static str, Vec<u8>)>,
    }

    impl SiteFetcher {
        fn page(mut self, url: &str, content_type: &'static str, body: &str) -> Self {
            self.pages
                .insert(url.to_string(), (content_type, body.as_bytes().to_vec()));
            self
        }
    }

    #[async_trait]
    impl ResourceFetcher for SiteFetcher {
        async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let Some((content_type, body)) = self.pages.get(request.url.as_str()) else {
                return Err(Error::ResourceFetch {
                    key: request.key().to_string(),
                    reason: "server answered 500 Internal Server Error".to_string(),
                    status: Some(500),
                });
            };
            Ok(FetchedResource {
                url: request.url.clone(),
                status: 200,
                content_type: Some((*content_type).to_string()),
                payload: body.clone(),
            })
        }
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            quiet_period: Duration::from_millis(50),
            capture_timeout: Duration::from_secs(5),
            ..CaptureOptions::default()
        }
    }

    fn session(fetcher: SiteFetcher, url: &str, dest: &Path) -> CaptureSession {
        session_with(fetcher, Arc::new(HttpBrowserLauncher::new()), url, dest, options())
    }

    fn session_with(
        fetcher: SiteFetcher,
        launcher: Arc<dyn BrowserLauncher>,
        url: &str,
        dest: &Path,
        options: CaptureOptions,
    ) -> CaptureSession {
        let cache = Arc::new(ResourceCache::new(Arc::new(fetcher), GenerationLimits::default()));
        let request = CaptureRequest::new(url, dest).unwrap().with_options(options);
        CaptureSession::new(request, launcher, cache)
    }

    #[tokio::test]
    async fn test_page_without_resources_captures_document_only() {
        let temp = TempDir::new().unwrap();
        let fetcher = SiteFetcher::default().page(
            "https://example.com/",
            "text/html",
            "<html><head><title>Bare page</title></head><body>hi</body></html>",
        );

        let session = session(fetcher, "https://example.com/", temp.path());
        let result = session.run().await.unwrap();

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(result.resource_count, 1);
        assert_eq!(result.title.as_deref(), Some("Bare page"));
        assert_eq!(result.archive_path, temp.path().join("Bare_page.pgz"));
        assert!(result.archive_path.exists());
    }

    #[tokio::test]
    async fn test_failed_resource_is_excluded_but_capture_completes() {
        let temp = TempDir::new().unwrap();
        let fetcher = SiteFetcher::default()
            .page(
                "https://example.com/",
                "text/html",
                r#"<link rel="stylesheet" href="/site.css"><img src="/broken.png">"#,
            )
            .page("https://example.com/site.css", "text/css", "body{}");

        let session = session(fetcher, "https://example.com/", temp.path());
        let result = session.run().await.unwrap();

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(result.resource_count, 2);
        assert_eq!(result.failed_count, 1);

        let reader = crate::archive::ArchiveReader::open(&result.archive_path).unwrap();
        let manifest = reader.manifest();
        assert!(manifest.resources.iter().all(|r| !r.url.ends_with("broken.png")));
        assert_eq!(manifest.failures.len(), 1);
        assert_eq!(manifest.failures[0].url, "https://example.com/broken.png");
    }

    #[tokio::test]
    async fn test_packaging_failure_leaves_no_archive() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file in the way").unwrap();
        let fetcher =
            SiteFetcher::default().page("https://example.com/", "text/html", "<title>x</title>");

        let session = session(fetcher, "https://example.com/", &blocker);
        let err = session.run().await.unwrap_err();

        assert_eq!(session.state(), SessionState::Failed(CaptureStage::Packaging));
        assert_eq!(err.stage(), Some(CaptureStage::Packaging));
        assert!(matches!(err.root(), Error::Packaging(_)));
        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "only the blocking file remains");
    }

    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl BrowserLauncher for CountingLauncher {
        async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserInstance>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            HttpBrowserLauncher::new().launch(profile).await
        }
    }

    #[tokio::test]
    async fn test_unknown_profile_mode_fails_before_launch() {
        let temp = TempDir::new().unwrap();
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let options = CaptureOptions {
            profile_modes: vec!["hidden".to_string(), "bogus".to_string()],
            ..options()
        };

        let session = session_with(
            SiteFetcher::default(),
            launcher.clone(),
            "https://example.com/",
            temp.path(),
            options,
        );
        let err = session.run().await.unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    struct BrokenLauncher;

    #[async_trait]
    impl BrowserLauncher for BrokenLauncher {
        async fn launch(&self, _profile: &BrowserProfile) -> Result<Box<dyn BrowserInstance>> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "browser binary not found",
            )))
        }
    }

    #[tokio::test]
    async fn test_launch_failure_is_launch_error() {
        let temp = TempDir::new().unwrap();
        let session = session_with(
            SiteFetcher::default(),
            Arc::new(BrokenLauncher),
            "https://example.com/",
            temp.path(),
            options(),
        );

        let err = session.run().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Failed(CaptureStage::Launching));
        assert!(matches!(err.root(), Error::Launch(msg) if msg.contains("browser binary")));
    }

    #[tokio::test]
    async fn test_navigation_failure_is_navigation_error() {
        let temp = TempDir::new().unwrap();
        let session = session(SiteFetcher::default(), "https://example.com/", temp.path());

        let err = session.run().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Failed(CaptureStage::Navigating));
        assert!(matches!(err.root(), Error::Navigation { .. }));
    }

    #[tokio::test]
    async fn test_packaging_starts_after_first_idle() {
        let temp = TempDir::new().unwrap();
        let fetcher = SiteFetcher::default()
            .page("https://example.com/", "text/html", r#"<script src="/app.js"></script>"#)
            .page("https://example.com/app.js", "application/javascript", "1");

        let events = Arc::new(Mutex::new(Vec::<ProgressEvent>::new()));
        let sink = Arc::clone(&events);
        let session = session(fetcher, "https://example.com/", temp.path())
            .with_progress(Arc::new(move |event: &ProgressEvent| sink.lock().push(*event)));
        let result = session.run().await.unwrap();

        let timeline = result.timeline;
        assert!(timeline.packaging_started > timeline.first_idle);
        assert!(timeline.network_complete >= timeline.first_idle + Duration::from_millis(50));
        assert_eq!(events.lock().last().unwrap().pending_count, 0);
        assert_eq!(events.lock().len(), 4);
    }

    /// Dispatches a request that never settles.
    struct HangingBrowser {
        profile: BrowserProfile,
        stuck: Option<InFlightRequest>,
    }

    #[async_trait]
    impl BrowserInstance for HangingBrowser {
        fn profile(&self) -> &BrowserProfile {
            &self.profile
        }

        async fn navigate(
            &mut self,
            url: &Url,
            interceptor: &NetworkInterceptor,
            _options: &NavigationOptions,
        ) -> Result<Navigation> {
            let document = interceptor.begin(ResourceRequest::for_url(url.clone()));
            let key = document.request().key();
            self.stuck = Some(document);
            Ok(Navigation {
                requested_url: url.clone(),
                final_url: url.clone(),
                title: None,
                document: key,
                amp: false,
            })
        }

        async fn close(&mut self) -> Result<()> {
            self.stuck = None;
            Ok(())
        }
    }

    struct HangingLauncher;

    #[async_trait]
    impl BrowserLauncher for HangingLauncher {
        async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserInstance>> {
            Ok(Box::new(HangingBrowser {
                profile: profile.clone(),
                stuck: None,
            }))
        }
    }

    #[tokio::test]
    async fn test_capture_timeout_fails_in_capturing_stage() {
        let temp = TempDir::new().unwrap();
        let options = CaptureOptions {
            capture_timeout: Duration::from_millis(200),
            ..options()
        };
        let session = session_with(
            SiteFetcher::default(),
            Arc::new(HangingLauncher),
            "https://example.com/",
            temp.path(),
            options,
        );

        let err = session.run().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Failed(CaptureStage::Capturing));
        assert!(matches!(err.root(), Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_session() {
        let temp = TempDir::new().unwrap();
        let session = session_with(
            SiteFetcher::default(),
            Arc::new(HangingLauncher),
            "https://example.com/",
            temp.path(),
            options(),
        );
        let token = session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = session.run().await.unwrap_err();
        assert!(matches!(err.root(), Error::Cancelled(_)));
        assert!(session.state().is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_during_packaging_leaves_no_archive() {
        let temp = TempDir::new().unwrap();
        let bulk = "0123456789abcdef".repeat(1 << 20);
        let fetcher = SiteFetcher::default()
            .page("https://example.com/", "text/html", r#"<title>Big</title><script src="/bulk.js"></script>"#)
            .page("https://example.com/bulk.js", "application/javascript", &bulk);

        let session = session(fetcher, "https://example.com/", temp.path());
        let token = session.cancellation_token();
        let mut states = session.subscribe();
        tokio::spawn(async move {
            if states.wait_for(|s| *s == SessionState::Packaging).await.is_ok() {
                token.cancel();
            }
        });

        let err = session.run().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Failed(CaptureStage::Packaging));
        assert!(matches!(err.root(), Error::Cancelled(_)));

        // The blocking writer may still be unwinding its temp file.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let names: Vec<_> = std::fs::read_dir(temp.path())
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert!(
                names.iter().all(|n| !n.to_string_lossy().ends_with(".pgz")),
                "abandoned archive left behind: {names:?}"
            );
            if names.is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "temp file never removed: {names:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_same_title_captures_get_distinct_archives() {
        let temp = TempDir::new().unwrap();
        let site = || {
            SiteFetcher::default().page("https://example.com/", "text/html", "<title>Same</title>")
        };

        let first = session(site(), "https://example.com/", temp.path());
        let second = session(site(), "https://example.com/", temp.path());
        let (a, b) = tokio::join!(first.run(), second.run());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.archive_path, b.archive_path);
        let mut names: Vec<_> = [&a.archive_path, &b.archive_path]
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Same-1.pgz", "Same.pgz"]);
        for path in [&a.archive_path, &b.archive_path] {
            crate::archive::ArchiveReader::open(path).unwrap();
        }
    }

    #[test]
    fn test_derive_archive_stem() {
        let url = Url::parse("https://news.example.com/world/story-1").unwrap();
        assert_eq!(derive_archive_stem(Some("  A Story "), &url), "A Story");
        assert_eq!(derive_archive_stem(None, &url), "news.example.com_world_story-1");
        assert_eq!(
            derive_archive_stem(Some(""), &Url::parse("https://example.com/").unwrap()),
            "example.com"
        );
    }

    #[test]
    fn test_request_rejects_non_http_urls() {
        assert!(matches!(
            CaptureRequest::new("file:///etc/passwd", "/tmp"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(CaptureRequest::new("https://example.com", "/tmp").is_ok());
    }
}
