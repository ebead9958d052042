use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use thiserror::Error;
use url::Url;

use super::parser::parse_feed;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DISCOVERY_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// What discovery learned about a URL.
///
/// `hub_url` is present when the target (or the feed it points at)
/// advertises a WebSub hub; `feed_url` is the feed to poll when it does
/// not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovered {
    pub hub_url: Option<String>,
    pub feed_url: Option<String>,
}

/// Errors that can occur during hub/feed discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// HTTP request failed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Target answered with a non-success status.
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 10-second timeout.
    #[error("request timed out")]
    Timeout,
    /// Response body exceeded the 5MB size limit.
    #[error("response too large")]
    TooLarge,
}

/// WebSub hub and feed discovery.
///
/// Given a URL, looks for a hub in this order: response `Link` headers
/// (`rel=hub`), feed-level hub links in a parseable body, then
/// `<link rel="hub">` tags in HTML. HTML pages also yield a feed link
/// (`rel="alternate"` / `rel="feed"`), and one follow-up fetch of that
/// feed (depth 1) may still surface a hub. Header hubs win over body
/// hubs.
pub struct Discovery {
    http: reqwest::Client,
}

/// Outcome of probing a single URL, before the depth-1 follow-up.
#[derive(Debug, Default)]
struct Probe {
    hub_url: Option<String>,
    feed_url: Option<String>,
    /// True when the body itself parsed as a feed.
    is_feed: bool,
}

impl Discovery {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Discover a hub and/or feed for `url`.
    ///
    /// # Errors
    ///
    /// Fails on network errors, non-2xx responses, timeout, or an
    /// oversized body for the *initial* fetch; the optional follow-up
    /// fetch degrades silently.
    pub async fn discover(&self, url: &str) -> Result<Discovered, DiscoveryError> {
        let probe = self.probe(url).await?;
        let mut hub_url = probe.hub_url;
        let mut feed_url = probe.feed_url;

        // Depth-1 recursion: an HTML page handed us a feed link but no
        // hub; the feed itself may still advertise one.
        if hub_url.is_none() && !probe.is_feed {
            if let Some(candidate) = feed_url.clone() {
                if candidate != url {
                    match self.probe(&candidate).await {
                        Ok(inner) => {
                            hub_url = inner.hub_url;
                            if inner.is_feed {
                                feed_url = Some(candidate);
                            }
                        }
                        Err(err) => {
                            tracing::debug!(url = %candidate, error = %err, "Follow-up feed probe failed");
                        }
                    }
                }
            }
        }

        Ok(Discovered { hub_url, feed_url })
    }

    async fn probe(&self, url: &str) -> Result<Probe, DiscoveryError> {
        let response = tokio::time::timeout(DISCOVERY_TIMEOUT, self.http.get(url).send())
            .await
            .map_err(|_| DiscoveryError::Timeout)?
            .map_err(DiscoveryError::Network)?;

        if !response.status().is_success() {
            return Err(DiscoveryError::HttpStatus(response.status().as_u16()));
        }

        let mut probe = Probe::default();

        // Link headers take precedence over anything in the body.
        for value in response.headers().get_all(reqwest::header::LINK) {
            if let Ok(raw) = value.to_str() {
                for (href, rel) in parse_link_header(raw) {
                    if rel_contains(&rel, "hub")
                        && probe.hub_url.is_none()
                        && Url::parse(&href).is_ok()
                    {
                        probe.hub_url = Some(href.clone());
                    }
                    if rel_contains(&rel, "self") && probe.feed_url.is_none() {
                        probe.feed_url = Some(href.clone());
                    }
                }
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let bytes = read_limited(response).await?;

        if let Ok(parsed) = parse_feed(&bytes) {
            probe.is_feed = true;
            if probe.hub_url.is_none() {
                probe.hub_url = parsed.hub_url;
            }
            if probe.feed_url.is_none() {
                probe.feed_url = Some(parsed.self_url.unwrap_or_else(|| url.to_owned()));
            }
        } else if content_type.contains("text/html") || content_type.contains("application/xhtml")
        {
            let html = String::from_utf8_lossy(&bytes);
            if probe.hub_url.is_none() {
                probe.hub_url = find_hub_link_in_html(&html, url);
            }
            if probe.feed_url.is_none() {
                probe.feed_url = find_feed_link_in_html(&html, url);
            }
        }

        Ok(probe)
    }
}

/// Reads a response body with the discovery size limit.
async fn read_limited(response: reqwest::Response) -> Result<Vec<u8>, DiscoveryError> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_DISCOVERY_SIZE {
            return Err(DiscoveryError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DiscoveryError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > MAX_DISCOVERY_SIZE {
            return Err(DiscoveryError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Parses an HTTP `Link` header value into `(href, rel)` pairs.
///
/// Handles the common shape `<url>; rel="hub", <url2>; rel="self"`.
/// Entries without a rel parameter are dropped.
pub(crate) fn parse_link_header(raw: &str) -> Vec<(String, String)> {
    let mut links = Vec::new();
    for part in raw.split(',') {
        let mut segments = part.split(';');
        let target = match segments.next() {
            Some(t) => t.trim(),
            None => continue,
        };
        let href = match target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            Some(href) => href.to_owned(),
            None => continue,
        };
        for param in segments {
            let param = param.trim();
            if let Some(value) = param
                .strip_prefix("rel=")
                .or_else(|| param.strip_prefix("REL="))
            {
                let rel = value.trim_matches('"').trim_matches('\'').to_owned();
                links.push((href.clone(), rel));
                break;
            }
        }
    }
    links
}

/// A Link rel value can carry several space-separated relations.
pub(crate) fn rel_contains(rel: &str, wanted: &str) -> bool {
    rel.split_whitespace().any(|r| r.eq_ignore_ascii_case(wanted))
}

/// Scans HTML for `<link rel="hub" href="…">` (either attribute order).
fn find_hub_link_in_html(html: &str, base_url: &str) -> Option<String> {
    let rel_first = Regex::new(r#"(?i)<link[^>]*rel=["']hub["'][^>]*href=["']([^"']+)["']"#).ok()?;
    let href_first =
        Regex::new(r#"(?i)<link[^>]*href=["']([^"']+)["'][^>]*rel=["']hub["']"#).ok()?;

    let href = rel_first
        .captures(html)
        .or_else(|| href_first.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())?;

    Some(resolve_url(href, base_url))
}

/// Scans HTML for `<link rel="alternate"|"feed" href="…">`.
fn find_feed_link_in_html(html: &str, base_url: &str) -> Option<String> {
    let rel_first =
        Regex::new(r#"(?i)<link[^>]*rel=["'](?:alternate|feed)["'][^>]*href=["']([^"']+)["']"#)
            .ok()?;
    let href_first =
        Regex::new(r#"(?i)<link[^>]*href=["']([^"']+)["'][^>]*rel=["'](?:alternate|feed)["']"#)
            .ok()?;

    let href = rel_first
        .captures(html)
        .or_else(|| href_first.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())?;

    Some(resolve_url(href, base_url))
}

/// Resolves a potentially relative href against the page URL.
fn resolve_url(href: &str, base_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }
    if let Ok(base) = Url::parse(base_url) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }
    href.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    // --- Unit tests (no network) ---

    #[test]
    fn test_parse_link_header_pairs() {
        let links = parse_link_header(
            r#"<https://hub.example.com/>; rel="hub", <https://example.com/feed>; rel="self""#,
        );
        assert_eq!(
            links,
            vec![
                ("https://hub.example.com/".to_owned(), "hub".to_owned()),
                ("https://example.com/feed".to_owned(), "self".to_owned()),
            ]
        );
    }

    #[test]
    fn test_parse_link_header_ignores_malformed() {
        assert!(parse_link_header("no-angle-brackets; rel=\"hub\"").is_empty());
        assert!(parse_link_header("<https://x.example/>; title=\"no rel\"").is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Header values come off the wire; malformed input must
            // degrade to an empty result, never a panic.
            #[test]
            fn prop_parse_link_header_never_panics(raw in ".*") {
                let _ = parse_link_header(&raw);
            }
        }
    }

    #[test]
    fn test_rel_contains_multi_valued() {
        assert!(rel_contains("self alternate", "self"));
        assert!(rel_contains("HUB", "hub"));
        assert!(!rel_contains("selfish", "self"));
    }

    #[test]
    fn test_find_hub_link_attribute_orders() {
        let a = r#"<link rel="hub" href="https://hub.example.com/">"#;
        let b = r#"<link href="https://hub.example.com/" rel="hub">"#;
        assert_eq!(
            find_hub_link_in_html(a, "https://example.com/"),
            Some("https://hub.example.com/".to_owned())
        );
        assert_eq!(
            find_hub_link_in_html(b, "https://example.com/"),
            Some("https://hub.example.com/".to_owned())
        );
    }

    #[test]
    fn test_find_feed_link_resolves_relative() {
        let html = r#"<link rel="alternate" type="application/atom+xml" href="/feed.xml">"#;
        assert_eq!(
            find_feed_link_in_html(html, "https://example.com/blog.html"),
            Some("https://example.com/feed.xml".to_owned())
        );
    }

    // --- Integration tests over wiremock ---

    const FEED_WITH_HUB: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>F</title>
  <link href="https://hub.example.com/" rel="hub"/>
  <entry><id>1</id><title>a</title></entry>
</feed>"#;

    const FEED_PLAIN: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>F</title></channel></rss>"#;

    #[tokio::test]
    async fn test_header_hub_wins_over_body_hub() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", "<https://header-hub.example.com/>; rel=\"hub\"")
                    .set_body_raw(
                        FEED_WITH_HUB,
                        "application/atom+xml",
                    ),
            )
            .mount(&server)
            .await;

        let discovery = Discovery::new(client());
        let found = discovery
            .discover(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(found.hub_url.as_deref(), Some("https://header-hub.example.com/"));
    }

    #[tokio::test]
    async fn test_feed_body_yields_hub() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        FEED_WITH_HUB,
                        "application/atom+xml",
                    ),
            )
            .mount(&server)
            .await;

        let discovery = Discovery::new(client());
        let url = format!("{}/feed", server.uri());
        let found = discovery.discover(&url).await.unwrap();
        assert_eq!(found.hub_url.as_deref(), Some("https://hub.example.com/"));
        assert_eq!(found.feed_url.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn test_html_page_yields_feed_no_hub() {
        let server = MockServer::start().await;
        let html = r#"<html><head>
<link rel="alternate" type="application/atom+xml" href="/feed.xml">
</head><body>hi</body></html>"#;
        Mock::given(method("GET"))
            .and(path("/blog.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(html, "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        FEED_PLAIN,
                        "application/rss+xml",
                    ),
            )
            .mount(&server)
            .await;

        let discovery = Discovery::new(client());
        let found = discovery
            .discover(&format!("{}/blog.html", server.uri()))
            .await
            .unwrap();
        assert_eq!(found.hub_url, None);
        assert_eq!(
            found.feed_url,
            Some(format!("{}/feed.xml", server.uri()))
        );
    }

    #[tokio::test]
    async fn test_html_feed_link_depth_one_finds_hub() {
        let server = MockServer::start().await;
        let html = r#"<link rel="alternate" type="application/atom+xml" href="/feed.xml">"#;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(html, "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        FEED_WITH_HUB,
                        "application/atom+xml",
                    ),
            )
            .mount(&server)
            .await;

        let discovery = Discovery::new(client());
        let found = discovery
            .discover(&format!("{}/page", server.uri()))
            .await
            .unwrap();
        assert_eq!(found.hub_url.as_deref(), Some("https://hub.example.com/"));
    }

    #[tokio::test]
    async fn test_non_success_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let discovery = Discovery::new(client());
        let err = discovery
            .discover(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::HttpStatus(404)));
    }
}
