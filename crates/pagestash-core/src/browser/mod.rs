//! Browser collaborator interface and the network interception seam.
//!
//! A capture session never talks to the network itself. It launches a
//! [`BrowserInstance`] through a [`BrowserLauncher`] and hands it a
//! [`NetworkInterceptor`]; every request the browser issues goes through the
//! interceptor, which records it with the session's pending request tracker
//! and serves it from the session's cache generation.
//!
//! [`HttpBrowser`] is the built-in implementation: it loads documents over
//! HTTP and discovers subresources from markup and stylesheets.

mod discover;
mod http;

pub use discover::{DiscoveredResource, extract_amp_link, extract_css_refs, extract_html_refs, extract_title};
pub use http::{HttpBrowser, HttpBrowserLauncher};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::cache::ResourceCache;
use crate::profile::BrowserProfile;
use crate::resource::{CachedResource, ResourceKey, ResourceRequest};
use crate::tracker::{PendingRequestTracker, RequestId, Settlement};
use crate::{Error, Result};

/// Starts browser instances.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a browser configured by `profile`.
    ///
    /// Failures must be reported as [`Error::Launch`].
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserInstance>>;
}

/// A running browser.
#[async_trait]
pub trait BrowserInstance: Send {
    /// Profile the instance was launched with.
    fn profile(&self) -> &BrowserProfile;

    /// Navigate to `url`, routing every request through `interceptor`.
    ///
    /// Returns once the main document has loaded. Subresources may still be
    /// loading afterwards; the interceptor's tracker reports when they settle.
    async fn navigate(
        &mut self,
        url: &Url,
        interceptor: &NetworkInterceptor,
        options: &NavigationOptions,
    ) -> Result<Navigation>;

    /// Stop all page activity and release the instance.
    ///
    /// Reports [`Error::BrowserCrashed`] if the page died while loading.
    async fn close(&mut self) -> Result<()>;
}

/// Options for a single navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationOptions {
    /// Follow `<link rel="amphtml">` and capture the AMP variant.
    pub prefer_amp: bool,
    /// Subresource fetches run concurrently.
    pub max_concurrent_fetches: usize,
}

impl Default for NavigationOptions {
    fn default() -> Self {
        Self {
            prefer_amp: true,
            max_concurrent_fetches: 8,
        }
    }
}

/// Outcome of a completed main-document load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// URL the navigation was asked for.
    pub requested_url: Url,
    /// URL of the document actually captured (after redirects or AMP).
    pub final_url: Url,
    /// Document title, if the page has one.
    pub title: Option<String>,
    /// Cache key of the captured document.
    pub document: ResourceKey,
    /// Whether the AMP variant was captured.
    pub amp: bool,
}

/// A resource that could not be captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFailure {
    /// Normalized request identity.
    pub key: ResourceKey,
    /// Requested URL.
    pub url: String,
    /// Why it failed.
    pub reason: String,
}

/// Routes browser requests through the tracker and the cache.
///
/// Cheap to clone; clones share the same tracker, cache and failure log.
#[derive(Clone)]
pub struct NetworkInterceptor {
    cache: Arc<ResourceCache>,
    tracker: Arc<PendingRequestTracker>,
    cancel: CancellationToken,
    next_id: Arc<AtomicU64>,
    failures: Arc<Mutex<Vec<ResourceFailure>>>,
}

impl NetworkInterceptor {
    /// Create an interceptor for one session.
    #[must_use]
    pub fn new(
        cache: Arc<ResourceCache>,
        tracker: Arc<PendingRequestTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cache,
            tracker,
            cancel,
            next_id: Arc::new(AtomicU64::new(1)),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Dispatch a request. It is pending from this call until the returned
    /// guard is dropped.
    #[must_use]
    pub fn begin(&self, request: ResourceRequest) -> InFlightRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tracker.dispatched(id);
        InFlightRequest {
            id,
            request,
            interceptor: self.clone(),
            outcome: None,
        }
    }

    /// Dispatch a request, wait for it and settle it.
    pub async fn fetch(&self, request: ResourceRequest) -> Result<Arc<CachedResource>> {
        self.begin(request).complete().await
    }

    /// Cache generation requests are served from.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Tracker requests are recorded with.
    #[must_use]
    pub fn tracker(&self) -> &Arc<PendingRequestTracker> {
        &self.tracker
    }

    /// Session cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resources that failed so far, in failure order.
    #[must_use]
    pub fn failures(&self) -> Vec<ResourceFailure> {
        self.failures.lock().clone()
    }

    fn record_failure(&self, request: &ResourceRequest, err: &Error) {
        let key = request.key();
        warn!(key = %key, error = %err, "resource fetch failed, leaving it out of the archive");
        self.failures.lock().push(ResourceFailure {
            key,
            url: request.url.to_string(),
            reason: err.to_string(),
        });
    }
}

/// A dispatched request that has not settled yet.
///
/// Dropping the guard settles the request: as completed if [`fetch`]
/// succeeded, as failed otherwise. Every dispatched id therefore leaves the
/// pending set exactly once, even when the owning task is aborted.
///
/// [`fetch`]: InFlightRequest::fetch
pub struct InFlightRequest {
    id: RequestId,
    request: ResourceRequest,
    interceptor: NetworkInterceptor,
    outcome: Option<Settlement>,
}

impl InFlightRequest {
    /// Tracker id of this request.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// The request being served.
    #[must_use]
    pub const fn request(&self) -> &ResourceRequest {
        &self.request
    }

    /// Fetch through the cache without settling yet.
    ///
    /// Lets a caller dispatch follow-up requests (found in this response)
    /// before this one settles, so the tracker does not drain in between.
    pub async fn fetch(&mut self) -> Result<Arc<CachedResource>> {
        let outcome = self
            .interceptor
            .cache
            .fetch(&self.request, &self.interceptor.cancel)
            .await;
        match &outcome {
            Ok(_) => self.outcome = Some(Settlement::Completed),
            Err(Error::Cancelled(_)) => self.outcome = Some(Settlement::Failed),
            Err(err) => {
                self.interceptor.record_failure(&self.request, err);
                self.outcome = Some(Settlement::Failed);
            },
        }
        outcome
    }

    /// Fetch and settle.
    pub async fn complete(mut self) -> Result<Arc<CachedResource>> {
        self.fetch().await
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        let settlement = self.outcome.unwrap_or(Settlement::Failed);
        self.interceptor.tracker.settled(self.id, settlement);
    }
}
