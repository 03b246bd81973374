//! Request identity and cached resource types.
//!
//! A [`ResourceKey`] is the normalized identity of an outbound request. It is
//! what the resource cache deduplicates on and what the archive indexes by, so
//! the normalization rules here decide what counts as "the same resource":
//!
//! - the method is upper-cased
//! - the URL is parsed and re-serialized (scheme and host lower-cased, default
//!   port dropped, dot segments resolved)
//! - the fragment is removed, the query string is kept verbatim
//! - of all request headers only `Range` participates
//!
//! ```rust
//! use pagestash_core::resource::{ResourceKey, ResourceRequest};
//!
//! let a = ResourceRequest::get("HTTPS://Example.com:443/a/../style.css#top")?;
//! let b = ResourceRequest::get("https://example.com/style.css")?;
//! assert_eq!(ResourceKey::from_request(&a), ResourceKey::from_request(&b));
//! # Ok::<(), pagestash_core::Error>(())
//! ```

use std::fmt::{self, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{Error, Result};

/// Headers that change the payload a server returns and therefore take part
/// in request identity.
const IDENTITY_HEADERS: &[&str] = &["range"];

/// Rough classification of a resource, used for logging and the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// The page's main HTML document.
    Document,
    /// CSS stylesheet.
    Stylesheet,
    /// JavaScript.
    Script,
    /// Raster or vector image.
    Image,
    /// Web font.
    Font,
    /// Anything else.
    Other,
}

impl ResourceKind {
    /// Guess the kind from a URL path extension.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let path = url.path().to_ascii_lowercase();
        let ext = path.rsplit_once('.').map_or("", |(_, ext)| ext);
        match ext {
            "css" => Self::Stylesheet,
            "js" | "mjs" => Self::Script,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif" | "bmp" => {
                Self::Image
            },
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Self::Font,
            "html" | "htm" => Self::Document,
            _ => Self::Other,
        }
    }
}

/// An outbound request issued by the browser during a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// HTTP method, upper-case.
    pub method: String,
    /// Absolute request URL.
    pub url: Url,
    /// Request headers as sent by the page.
    pub headers: Vec<(String, String)>,
    /// What the page wants this resource for.
    pub kind: ResourceKind,
}

impl ResourceRequest {
    /// Build a `GET` request for an absolute URL.
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::for_url(url))
    }

    /// Build a `GET` request from an already parsed URL.
    #[must_use]
    pub fn for_url(url: Url) -> Self {
        let kind = ResourceKind::from_url(&url);
        Self {
            method: "GET".to_string(),
            url,
            headers: Vec::new(),
            kind,
        }
    }

    /// Set the resource kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Normalized identity of this request.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::from_request(self)
    }
}

/// Normalized request identity: method, URL and identity headers.
///
/// The string form is `METHOD URL[ name=value...]` and is stable across
/// processes, so it doubles as the logical path of a resource in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Compute the key for a request.
    #[must_use]
    pub fn from_request(request: &ResourceRequest) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);

        let mut key = format!("{} {}", request.method.to_ascii_uppercase(), url);

        let mut identity: Vec<(String, &str)> = request
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
            .filter(|(name, _)| IDENTITY_HEADERS.contains(&name.as_str()))
            .collect();
        identity.sort();
        for (name, value) in identity {
            // write! to String is infallible
            let _ = write!(key, " {name}={value}");
        }

        Self(key)
    }

    /// Rebuild a key from its string form (as stored in an archive manifest).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable identifier used for archive entry names: `rs_<sha256 hex>`.
    #[must_use]
    pub fn entry_id(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        let hex = digest.iter().fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        });
        format!("rs_{hex}")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource fetched during a capture and stored in the cache.
///
/// Immutable once stored; shared between concurrent callers through `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResource {
    /// Normalized request identity.
    pub key: ResourceKey,
    /// Final URL the payload came from (after redirects).
    pub url: Url,
    /// Request method.
    pub method: String,
    /// HTTP status of the response.
    pub status: u16,
    /// `Content-Type` of the response, when the server sent one.
    pub content_type: Option<String>,
    /// Response body.
    pub payload: Vec<u8>,
    /// Kind the page requested it as.
    pub kind: ResourceKind,
    /// When the fetch completed.
    pub fetched_at: DateTime<Utc>,
}

impl CachedResource {
    /// Size of the payload in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is HTML, judged by content type.
    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }

    /// Whether the payload is CSS, judged by content type or requested kind.
    #[must_use]
    pub fn is_css(&self) -> bool {
        self.kind == ResourceKind::Stylesheet
            || self
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/css"))
    }

    /// Payload as text (lossy UTF-8).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
