use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

use super::discover::{self, DiscoveredResource};
use super::{BrowserInstance, BrowserLauncher, InFlightRequest, Navigation, NavigationOptions, NetworkInterceptor};
use crate::profile::BrowserProfile;
use crate::resource::{CachedResource, ResourceKey, ResourceKind, ResourceRequest};
use crate::{Error, Result};

/// Launches [`HttpBrowser`] instances.
#[derive(Debug, Clone, Default)]
pub struct HttpBrowserLauncher {
    user_agent: Option<String>,
}

impl HttpBrowserLauncher {
    /// Create a launcher.
    #[must_use]
    pub const fn new() -> Self {
        Self { user_agent: None }
    }

    /// `User-Agent` header attached to every request the browser issues.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

#[async_trait]
impl BrowserLauncher for HttpBrowserLauncher {
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserInstance>> {
        debug!(
            profile = %profile.name,
            visibility = ?profile.visibility,
            "launching http browser"
        );
        Ok(Box::new(HttpBrowser {
            profile: profile.clone(),
            user_agent: self.user_agent.clone(),
            loading: None,
        }))
    }
}

/// Built-in browser that loads pages over HTTP without executing them.
///
/// The main document is fetched during [`navigate`](BrowserInstance::navigate);
/// subresources found in the markup, and recursively in stylesheets, are loaded
/// by a background task after it returns. Scripts are skipped when the profile
/// disables JavaScript, images when it disables images.
pub struct HttpBrowser {
    profile: BrowserProfile,
    user_agent: Option<String>,
    loading: Option<JoinHandle<()>>,
}

impl HttpBrowser {
    fn request_for(&self, url: Url, kind: ResourceKind) -> ResourceRequest {
        let request = ResourceRequest::for_url(url).with_kind(kind);
        match &self.user_agent {
            Some(agent) => request.with_header("User-Agent", agent.clone()),
            None => request,
        }
    }

    fn wants(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Script => self.profile.capabilities.javascript,
            ResourceKind::Image => self.profile.capabilities.images,
            _ => true,
        }
    }

    /// Load a document, returning it together with its still-unsettled flight.
    async fn load_document(
        &self,
        url: &Url,
        interceptor: &NetworkInterceptor,
    ) -> Result<(InFlightRequest, Arc<CachedResource>)> {
        let mut flight = interceptor.begin(self.request_for(url.clone(), ResourceKind::Document));
        match flight.fetch().await {
            Ok(document) => Ok((flight, document)),
            Err(err @ Error::Cancelled(_)) => Err(err),
            Err(err) => Err(Error::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl BrowserInstance for HttpBrowser {
    fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    async fn navigate(
        &mut self,
        url: &Url,
        interceptor: &NetworkInterceptor,
        options: &NavigationOptions,
    ) -> Result<Navigation> {
        if let Some(previous) = self.loading.take() {
            previous.abort();
        }

        let (mut flight, mut document) = self.load_document(url, interceptor).await?;
        let mut amp = false;

        if options.prefer_amp && document.is_html() {
            if let Some(amp_url) = discover::extract_amp_link(&document.text(), &document.url) {
                if amp_url != document.url {
                    info!("Following AMP variant {} of {}", amp_url, url);
                    // The canonical flight stays pending while the AMP one loads.
                    match self.load_document(&amp_url, interceptor).await {
                        Ok((amp_flight, amp_document)) => {
                            // Only the variant that is captured goes into the archive.
                            interceptor.cache().discard(&document.key);
                            flight = amp_flight;
                            document = amp_document;
                            amp = true;
                        },
                        Err(err @ Error::Cancelled(_)) => return Err(err),
                        Err(err) => warn!("AMP variant unavailable, keeping canonical page: {}", err),
                    }
                }
            }
        }

        let title = if document.is_html() {
            discover::extract_title(&document.text())
        } else {
            None
        };

        let refs = if document.is_html() {
            discover::extract_html_refs(&document.text(), &document.url)
        } else {
            Vec::new()
        };

        let seen = Arc::new(Mutex::new(HashSet::from([flight.request().key()])));
        let children = self.dispatch(refs, interceptor, &seen);
        debug!(
            url = %document.url,
            subresources = children.len(),
            "main document loaded"
        );

        let navigation = Navigation {
            requested_url: url.clone(),
            final_url: document.url.clone(),
            title,
            document: document.key.clone(),
            amp,
        };

        let loader = SubresourceLoader {
            browser: self.clone_config(),
            interceptor: interceptor.clone(),
            seen,
            limiter: Arc::new(Semaphore::new(options.max_concurrent_fetches.max(1))),
        };
        self.loading = Some(tokio::spawn(loader.run(children)));

        // Children are already pending, so settling the document cannot drain the tracker early.
        drop(flight);
        Ok(navigation)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(loading) = self.loading.take() else {
            return Ok(());
        };
        loading.abort();
        match loading.await {
            Err(err) if err.is_panic() => Err(Error::BrowserCrashed(format!(
                "page loader for profile '{}' panicked",
                self.profile.name
            ))),
            _ => Ok(()),
        }
    }
}

impl HttpBrowser {
    fn clone_config(&self) -> Self {
        Self {
            profile: self.profile.clone(),
            user_agent: self.user_agent.clone(),
            loading: None,
        }
    }

    /// Dispatch every wanted, not yet requested reference.
    fn dispatch(
        &self,
        refs: Vec<DiscoveredResource>,
        interceptor: &NetworkInterceptor,
        seen: &Mutex<HashSet<ResourceKey>>,
    ) -> Vec<InFlightRequest> {
        let mut seen = seen.lock();
        refs.into_iter()
            .filter(|found| self.wants(found.kind))
            .map(|found| self.request_for(found.url, found.kind))
            .filter(|request| seen.insert(request.key()))
            .map(|request| interceptor.begin(request))
            .collect()
    }
}

impl Drop for HttpBrowser {
    fn drop(&mut self) {
        if let Some(loading) = self.loading.take() {
            loading.abort();
        }
    }
}

struct SubresourceLoader {
    browser: HttpBrowser,
    interceptor: NetworkInterceptor,
    seen: Arc<Mutex<HashSet<ResourceKey>>>,
    limiter: Arc<Semaphore>,
}

impl SubresourceLoader {
    async fn run(self, initial: Vec<InFlightRequest>) {
        let this = Arc::new(self);
        let mut tasks = JoinSet::new();
        let mut pending = initial;

        loop {
            for flight in pending.drain(..) {
                let this = Arc::clone(&this);
                tasks.spawn(async move { this.load(flight).await });
            }
            match tasks.join_next().await {
                Some(Ok(children)) => pending = children,
                Some(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Some(Err(_)) => {},
                None => break,
            }
        }
    }

    /// Fetch one subresource; stylesheets yield their own references, already dispatched.
    async fn load(&self, mut flight: InFlightRequest) -> Vec<InFlightRequest> {
        let Ok(_permit) = self.limiter.acquire().await else {
            return Vec::new();
        };
        let Ok(resource) = flight.fetch().await else {
            return Vec::new();
        };
        if !resource.is_css() {
            return Vec::new();
        }
        let refs = discover::extract_css_refs(&resource.text(), &resource.url);
        self.browser.dispatch(refs, &self.interceptor, &self.seen)
    }
}
