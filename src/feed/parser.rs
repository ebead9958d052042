use chrono::{DateTime, Utc};
use thiserror::Error;

/// A normalized feed: metadata plus entries, with WebSub-relevant links
/// surfaced.
///
/// Upstream feeds are loosely shaped (titles may be absent, categories
/// may carry a label or only a term, entries may lack ids), so this is
/// the one place that flattens all of that into plain fields.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    /// First feed-level `rel="hub"` link, if the feed advertises WebSub.
    pub hub_url: Option<String>,
    /// First feed-level `rel="self"` link.
    pub self_url: Option<String>,
    /// Entries in document order (feeds list newest first).
    pub entries: Vec<ParsedEntry>,
}

/// One normalized entry.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    /// The entry id, falling back to the first link href. Entries with
    /// neither are unidentifiable and carry `None`.
    pub guid: Option<String>,
    pub url: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
}

/// Errors from feed parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The bytes are not a recognizable RSS/Atom document.
    #[error("Not a parseable feed: {0}")]
    Malformed(#[from] feed_rs::parser::ParseFeedError),
}

/// Parses RSS or Atom bytes into a [`ParsedFeed`].
///
/// Format detection is handled by `feed-rs`. Extraction is tolerant:
/// a failure to pull any one field degrades that field, never the
/// parse.
///
/// # Errors
///
/// Returns [`ParseError::Malformed`] only when the document is not a
/// feed at all.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = feed_rs::parser::parse(bytes)?;

    let hub_url = link_with_rel(&feed.links, "hub");
    let self_url = link_with_rel(&feed.links, "self");

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let first_link = entry.links.first().map(|l| l.href.clone());
            let guid = if entry.id.trim().is_empty() {
                first_link.clone()
            } else {
                Some(entry.id.trim().to_owned())
            };

            let title = entry
                .title
                .map(|t| t.content)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Untitled".to_owned());

            let author = entry
                .authors
                .first()
                .map(|p| p.name.clone())
                .filter(|n| !n.trim().is_empty());

            let categories = entry
                .categories
                .into_iter()
                .map(|c| c.label.unwrap_or(c.term))
                .filter(|c| !c.trim().is_empty())
                .collect();

            ParsedEntry {
                guid,
                url: first_link,
                title,
                author,
                published: entry.published,
                updated: entry.updated,
                categories,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content).filter(|t| !t.trim().is_empty()),
        description: feed.description.map(|d| d.content),
        hub_url,
        self_url,
        entries,
    })
}

fn link_with_rel(links: &[feed_rs::model::Link], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() == Some(rel))
        .map(|l| l.href.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RSS_MINIMAL: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <description>A feed for tests</description>
    <item>
      <guid>entry-1</guid>
      <title>First Post</title>
      <link>https://example.com/1</link>
      <pubDate>Mon, 01 Jan 2024 12:00:00 GMT</pubDate>
      <category>rust</category>
    </item>
  </channel>
</rss>"#;

    const ATOM_WITH_HUB: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Hubbed Feed</title>
  <link href="https://hub.example.com/" rel="hub"/>
  <link href="https://example.com/feed.xml" rel="self"/>
  <entry>
    <id>urn:entry-1</id>
    <title>Post</title>
    <link href="https://example.com/post/1"/>
    <updated>2024-01-02T00:00:00Z</updated>
    <author><name>Alice</name></author>
  </entry>
</feed>"#;

    const RSS_NO_GUID: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><item>
  <title>Linked Only</title>
  <link>https://example.com/only-link</link>
</item></channel></rss>"#;

    #[test]
    fn test_parse_rss_basic() {
        let feed = parse_feed(RSS_MINIMAL.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Test Feed"));
        assert_eq!(feed.description.as_deref(), Some("A feed for tests"));
        assert_eq!(feed.hub_url, None);
        assert_eq!(feed.entries.len(), 1);

        let entry = &feed.entries[0];
        assert_eq!(entry.guid.as_deref(), Some("entry-1"));
        assert_eq!(entry.title, "First Post");
        assert_eq!(entry.url.as_deref(), Some("https://example.com/1"));
        assert!(entry.published.is_some());
        assert_eq!(entry.categories, vec!["rust".to_owned()]);
    }

    #[test]
    fn test_parse_atom_hub_links() {
        let feed = parse_feed(ATOM_WITH_HUB.as_bytes()).unwrap();
        assert_eq!(feed.hub_url.as_deref(), Some("https://hub.example.com/"));
        assert_eq!(feed.self_url.as_deref(), Some("https://example.com/feed.xml"));
        assert_eq!(feed.entries[0].author.as_deref(), Some("Alice"));
        assert_eq!(feed.entries[0].guid.as_deref(), Some("urn:entry-1"));
    }

    #[test]
    fn test_guid_falls_back_to_link() {
        let feed = parse_feed(RSS_NO_GUID.as_bytes()).unwrap();
        let entry = &feed.entries[0];
        // feed-rs may synthesize an id; when it does not, the link href
        // stands in. Either way the entry stays identifiable.
        assert!(entry.guid.is_some());
    }

    #[test]
    fn test_missing_title_defaults() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><item><guid>1</guid></item></channel></rss>"#;
        let feed = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(feed.entries[0].title, "Untitled");
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(parse_feed(b"<html><body>not a feed</body></html>").is_err());
        assert!(parse_feed(b"garbage").is_err());
    }

    #[test]
    fn test_empty_feed_ok() {
        let rss = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>E</title></channel></rss>"#;
        let feed = parse_feed(rss.as_bytes()).unwrap();
        assert!(feed.entries.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Untrusted bytes may fail to parse but must never panic.
            #[test]
            fn prop_parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
                let _ = parse_feed(&bytes);
            }

            #[test]
            fn prop_entry_title_never_empty(title in "[ \\t]*") {
                let rss = format!(
                    r#"<?xml version="1.0"?><rss version="2.0"><channel><item><guid>1</guid><title>{title}</title></item></channel></rss>"#
                );
                if let Ok(feed) = parse_feed(rss.as_bytes()) {
                    for entry in &feed.entries {
                        prop_assert!(!entry.title.trim().is_empty());
                    }
                }
            }
        }
    }
}
