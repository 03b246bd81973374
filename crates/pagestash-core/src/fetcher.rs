use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

use crate::resource::{CachedResource, ResourceRequest};
use crate::{Error, Result};

/// Backend that performs the actual network fetch for a resource.
///
/// The resource cache calls this at most once per key at a time; implement it
/// to plug in a different transport (or a mock in tests).
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch a resource over the network.
    ///
    /// Non-success statuses and transport failures must be reported as
    /// [`Error::ResourceFetch`] so the capture can absorb them.
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource>;
}

/// Raw response of a successful fetch, before it is stored in the cache.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// Final URL after redirects.
    pub url: url::Url,
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header value, if present.
    pub content_type: Option<String>,
    /// Response body.
    pub payload: Vec<u8>,
}

impl FetchedResource {
    /// Convert into an immutable cache entry for `request`.
    #[must_use]
    pub fn into_cached(self, request: &ResourceRequest) -> CachedResource {
        CachedResource {
            key: request.key(),
            url: self.url,
            method: request.method.clone(),
            status: self.status,
            content_type: self.content_type,
            payload: self.payload,
            kind: request.kind,
            fetched_at: Utc::now(),
        }
    }
}

/// HTTP client for fetching page resources
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a new fetcher with configured HTTP client
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Creates a new fetcher with a custom per-request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Self::with_user_agent(
            timeout,
            concat!("pagestash/", env!("CARGO_PKG_VERSION")),
        )
    }

    /// Creates a new fetcher with a custom timeout and user agent
    pub fn with_user_agent(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(Error::Network)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource> {
        let key = request.key();
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            Error::ResourceFetch {
                key: key.to_string(),
                reason: format!("invalid method: {e}"),
                status: None,
            }
        })?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                debug!("Skipping malformed header {} on {}", name, request.url);
                continue;
            };
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| Error::ResourceFetch {
            key: key.to_string(),
            reason: e.to_string(),
            status: None,
        })?;
        let status = response.status();

        if !status.is_success() {
            let reason = if status == StatusCode::NOT_FOUND {
                format!("resource not found at '{}'", request.url)
            } else {
                format!("server answered {status}")
            };
            return Err(Error::ResourceFetch {
                key: key.to_string(),
                reason,
                status: Some(status.as_u16()),
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);

        let payload = response.bytes().await.map_err(|e| Error::ResourceFetch {
            key: key.to_string(),
            reason: format!("failed to read body: {e}"),
            status: Some(status.as_u16()),
        })?;

        info!("Fetched {} bytes from {}", payload.len(), final_url);

        Ok(FetchedResource {
            url: final_url,
            status: status.as_u16(),
            content_type,
            payload: payload.to_vec(),
        })
    }
}
