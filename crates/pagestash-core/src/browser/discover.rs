//! Subresource discovery from HTML and CSS.
//!
//! The built-in browser does not run scripts or lay out pages; it finds the
//! resources a page would load by scanning markup and stylesheets.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::resource::ResourceKind;

/// A resource reference found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Absolute URL of the reference.
    pub url: Url,
    /// What the document uses it for.
    pub kind: ResourceKind,
}

/// Elements with a `src` attribute.
/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<(img|script|source|iframe|embed|video|audio|input|track)\b[^>]*?\ssrc\s*=\s*["']([^"']+)["']"#,
    )
    .unwrap()
});

/// Whole `<link ...>` tags.
/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());

/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static REL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\srel\s*=\s*["']([^"']+)["']"#).unwrap());

/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\shref\s*=\s*["']([^"']+)["']"#).unwrap());

/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static SRCSET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\ssrcset\s*=\s*["']([^"']+)["']"#).unwrap());

/// CSS `url(...)`, quoted or bare.
/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static CSS_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).unwrap());

/// CSS `@import "..."` without `url()`.
/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static CSS_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)@import\s+['"]([^'"]+)['"]"#).unwrap());

/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static IMPORT_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)@import\s+url\(\s*['"]?([^'")\s]+)"#).unwrap());

/// SAFETY: Pattern is a compile-time constant that is known to be valid.
#[allow(clippy::unwrap_used)]
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

/// Extract every subresource reference from an HTML document.
///
/// Covers `src` attributes, `srcset` candidates, `<link>` tags for
/// stylesheets, icons and preloads, and `url()` in inline styles. Results are
/// absolute, deduplicated and in document order; non-HTTP references
/// (`data:`, `javascript:`, ...) are dropped.
#[must_use]
pub fn extract_html_refs(html: &str, base: &Url) -> Vec<DiscoveredResource> {
    let mut found = Vec::new();

    for caps in SRC_RE.captures_iter(html) {
        let kind = match caps[1].to_ascii_lowercase().as_str() {
            "img" | "input" => ResourceKind::Image,
            "script" => ResourceKind::Script,
            "iframe" => ResourceKind::Document,
            _ => ResourceKind::Other,
        };
        push_ref(&mut found, base, &caps[2], Some(kind));
    }

    for caps in SRCSET_RE.captures_iter(html) {
        for candidate in caps[1].split(',') {
            if let Some(url) = candidate.split_whitespace().next() {
                push_ref(&mut found, base, url, Some(ResourceKind::Image));
            }
        }
    }

    for tag in LINK_RE.find_iter(html) {
        let tag = tag.as_str();
        let Some(rel) = REL_RE.captures(tag).map(|c| c[1].to_ascii_lowercase()) else {
            continue;
        };
        let Some(href) = HREF_RE.captures(tag).map(|c| c[1].to_string()) else {
            continue;
        };
        let rels: Vec<&str> = rel.split_whitespace().collect();
        let kind = if rels.contains(&"stylesheet") {
            Some(ResourceKind::Stylesheet)
        } else if rels.iter().any(|r| r.contains("icon")) {
            Some(ResourceKind::Image)
        } else if rels.contains(&"preload") || rels.contains(&"modulepreload") {
            // Fonts, scripts and images are all preloaded; the extension decides.
            None
        } else {
            continue;
        };
        push_ref(&mut found, base, &href, kind);
    }

    for caps in CSS_URL_RE.captures_iter(html) {
        push_ref(&mut found, base, &caps[1], None);
    }

    found
}

/// Extract `@import` and `url()` references from a stylesheet.
///
/// Imports are classified as stylesheets so they are scanned in turn.
#[must_use]
pub fn extract_css_refs(css: &str, base: &Url) -> Vec<DiscoveredResource> {
    let mut found = Vec::new();

    for caps in CSS_IMPORT_RE
        .captures_iter(css)
        .chain(IMPORT_URL_RE.captures_iter(css))
    {
        push_ref(&mut found, base, &caps[1], Some(ResourceKind::Stylesheet));
    }
    for caps in CSS_URL_RE.captures_iter(css) {
        push_ref(&mut found, base, &caps[1], None);
    }

    found
}

/// URL of the AMP variant advertised by `<link rel="amphtml">`.
#[must_use]
pub fn extract_amp_link(html: &str, base: &Url) -> Option<Url> {
    LINK_RE.find_iter(html).find_map(|tag| {
        let tag = tag.as_str();
        let rel = REL_RE.captures(tag)?;
        if !rel[1].split_whitespace().any(|r| r.eq_ignore_ascii_case("amphtml")) {
            return None;
        }
        let href = HREF_RE.captures(tag)?;
        resolve(base, &href[1])
    })
}

/// Text of the `<title>` element, entity-decoded and whitespace-collapsed.
#[must_use]
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE_RE.captures(html)?;
    let title = decode_entities(&raw[1])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!title.is_empty()).then_some(title)
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn push_ref(
    found: &mut Vec<DiscoveredResource>,
    base: &Url,
    reference: &str,
    kind: Option<ResourceKind>,
) {
    let Some(mut url) = resolve(base, &decode_entities(reference)) else {
        return;
    };
    url.set_fragment(None);
    if found.iter().any(|existing| existing.url == url) {
        return;
    }
    let kind = kind.unwrap_or_else(|| ResourceKind::from_url(&url));
    found.push(DiscoveredResource { url, kind });
}

fn resolve(base: &Url, reference: &str) -> Option<Url> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }
    let url = base.join(reference).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}
