//! End-to-end tests for the polling engine: conditional GETs, entry
//! deduplication, the WebSub upgrade path, and synthesized
//! notifications feeding the hub's fan-out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use superduperfeeder::config::Config;
use superduperfeeder::poller::PollOutcome;
use superduperfeeder::queue::{Queue, Worker};
use superduperfeeder::server::AppState;
use superduperfeeder::storage::{Store, Subscription};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_state() -> (AppState, Worker) {
    let store = Store::open(":memory:").await.unwrap();
    let queue = Queue::new(store.pool().clone(), Duration::from_secs(300));
    let http = superduperfeeder::util::build_http_client().unwrap();
    let state = AppState::assemble(store, queue.clone(), http, Arc::new(Config::default()));
    let worker = Worker::new(queue, state.dispatcher());
    (state, worker)
}

/// A verified subscription on `topic`, so fan-out has a destination.
async fn verified_subscription(state: &AppState, topic: &str, callback: &str) -> Subscription {
    let now = Utc::now();
    let sub = Subscription {
        id: Uuid::new_v4(),
        topic: topic.to_string(),
        callback: callback.to_string(),
        secret: None,
        lease_seconds: 86_400,
        created: now,
        expires: now + chrono::Duration::days(1),
        verified: true,
        verification_token: None,
        verification_expires: None,
        error_count: 0,
        last_error: None,
        last_error_time: None,
    };
    state.store.put_subscription(&sub).await.unwrap();
    sub
}

const RSS_TWO_ENTRIES: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Example</title><description>Things</description>
<item><guid>entry-2</guid><title>Newer</title><link>https://ex.com/2</link>
  <pubDate>Tue, 02 Jan 2024 00:00:00 GMT</pubDate></item>
<item><guid>entry-1</guid><title>Older</title><link>https://ex.com/1</link>
  <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;

const ATOM_WITH_HUB: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Hubbed</title>
  <link href="https://hub.example.com/" rel="hub"/>
  <entry><id>h-1</id><title>a</title><updated>2024-01-01T00:00:00Z</updated></entry>
</feed>"#;

// ============================================================================
// Conditional GET
// ============================================================================

#[tokio::test]
async fn test_conditional_get_304_short_circuits() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("If-None-Match", "\"abc\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&origin)
        .await;

    let (state, _worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    let mut feed = state.hub.ensure_feed(&url).await.unwrap();
    feed.etag = Some("\"abc\"".to_string());
    feed.last_fetched = Some(Utc::now() - chrono::Duration::hours(2));
    state.store.update_feed(&feed).await.unwrap();

    let before = Utc::now();
    let outcome = state.poller.poll_feed(feed.clone()).await.unwrap();
    assert_eq!(outcome, PollOutcome::NotModified);

    let after = state.store.feed(feed.id).await.unwrap().unwrap();
    assert!(after.last_fetched.unwrap() >= before);
    assert_eq!(after.error_count, 0);
    assert_eq!(state.store.items_for_feed(feed.id, 100).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_poll_sends_if_modified_since() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&origin)
        .await;

    let (state, _worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    let mut feed = state.hub.ensure_feed(&url).await.unwrap();
    feed.last_modified = Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string());
    state.store.update_feed(&feed).await.unwrap();

    let outcome = state.poller.poll_feed(feed).await.unwrap();
    assert_eq!(outcome, PollOutcome::NotModified);
}

// ============================================================================
// Entry processing
// ============================================================================

#[tokio::test]
async fn test_first_poll_ingests_and_notifies() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_raw(RSS_TWO_ENTRIES, "application/rss+xml"),
        )
        .mount(&origin)
        .await;

    let subscriber = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&subscriber)
        .await;

    let (state, worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    verified_subscription(&state, &url, &format!("{}/cb", subscriber.uri())).await;

    state.hub.ensure_feed(&url).await.unwrap();
    // ensure_feed queued the first poll; the worker runs it, and the
    // resulting Distribute in the same drain.
    worker.run_pending().await.unwrap();

    let feed = state.store.feed_by_url(&url).await.unwrap().unwrap();
    assert_eq!(feed.title.as_deref(), Some("Example"));
    assert_eq!(feed.description.as_deref(), Some("Things"));
    assert_eq!(feed.etag.as_deref(), Some("\"v1\""));
    assert!(feed.last_fetched.is_some());
    assert!(feed.last_updated.is_some());
    // Most recent entry by published date.
    assert_eq!(feed.last_processed_entry_id.as_deref(), Some("entry-2"));

    let items = state.store.items_for_feed(feed.id, 100).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].guid, "entry-2"); // newest first

    // The synthesized notification relayed the original body.
    let delivery = subscriber
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.method.as_str() == "POST")
        .expect("no distribution received");
    assert_eq!(delivery.body, RSS_TWO_ENTRIES.as_bytes());
    assert_eq!(
        delivery
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/rss+xml")
    );
}

#[tokio::test]
async fn test_second_poll_with_same_content_is_quiet() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    RSS_TWO_ENTRIES,
                    "application/rss+xml",
                ),
        )
        .mount(&origin)
        .await;

    let subscriber = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&subscriber)
        .await;

    let (state, worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    verified_subscription(&state, &url, &format!("{}/cb", subscriber.uri())).await;

    state.hub.ensure_feed(&url).await.unwrap();
    worker.run_pending().await.unwrap();

    // Re-poll with unchanged upstream content: the enumeration
    // short-circuits at the stored guid and nothing new is created.
    let feed = state.store.feed_by_url(&url).await.unwrap().unwrap();
    let outcome = state.poller.poll_feed(feed.clone()).await.unwrap();
    assert_eq!(outcome, PollOutcome::Processed { new_items: 0 });
    assert_eq!(state.store.items_for_feed(feed.id, 100).await.unwrap().len(), 2);

    worker.run_pending().await.unwrap();
    let posts = subscriber
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    // Only the first poll produced a notification.
    assert_eq!(posts, 1);
}

#[tokio::test]
async fn test_ingesting_same_entry_twice_yields_one_item() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    RSS_TWO_ENTRIES,
                    "application/rss+xml",
                ),
        )
        .mount(&origin)
        .await;

    let (state, _worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    let feed = state.hub.ensure_feed(&url).await.unwrap();

    // Two direct polls, no short-circuit state in between: the upsert
    // dedup carries the invariant.
    let mut fresh = feed.clone();
    fresh.last_processed_entry_id = None;
    state.poller.poll_feed(fresh.clone()).await.unwrap();
    state.poller.poll_feed(fresh).await.unwrap();

    assert_eq!(state.store.items_for_feed(feed.id, 100).await.unwrap().len(), 2);
}

// ============================================================================
// WebSub upgrade
// ============================================================================

#[tokio::test]
async fn test_feed_advertising_hub_leaves_polling_set() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    ATOM_WITH_HUB,
                    "application/atom+xml",
                ),
        )
        .mount(&origin)
        .await;

    let (state, worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    state.hub.ensure_feed(&url).await.unwrap();
    worker.run_pending().await.unwrap();

    let feed = state.store.feed_by_url(&url).await.unwrap().unwrap();
    assert!(feed.supports_websub);
    assert_eq!(feed.websub_hub.as_deref(), Some("https://hub.example.com/"));

    // The invariant: a websub feed is never in the due set.
    let due = state.poller.due_feeds().await.unwrap();
    assert!(due.iter().all(|f| f.id != feed.id));
}

// ============================================================================
// Failure accounting
// ============================================================================

#[tokio::test]
async fn test_poll_failure_marks_feed_then_success_resets() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    RSS_TWO_ENTRIES,
                    "application/rss+xml",
                ),
        )
        .mount(&origin)
        .await;

    let (state, _worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    let feed = state.hub.ensure_feed(&url).await.unwrap();

    assert!(state.poller.poll_feed(feed.clone()).await.is_err());
    let marked = state.store.feed(feed.id).await.unwrap().unwrap();
    assert_eq!(marked.error_count, 1);
    assert!(marked.last_error.as_deref().unwrap().contains("500"));
    assert!(marked.last_error_time.is_some());

    state.poller.poll_feed(marked).await.unwrap();
    let reset = state.store.feed(feed.id).await.unwrap().unwrap();
    assert_eq!(reset.error_count, 0);
    assert!(reset.last_error.is_none());
}

#[tokio::test]
async fn test_unparseable_body_is_an_error() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    "<html>not a feed</html>",
                    "text/html",
                ),
        )
        .mount(&origin)
        .await;

    let (state, _worker) = test_state().await;
    let url = format!("{}/feed", origin.uri());
    let feed = state.hub.ensure_feed(&url).await.unwrap();

    assert!(state.poller.poll_feed(feed.clone()).await.is_err());
    let marked = state.store.feed(feed.id).await.unwrap().unwrap();
    assert_eq!(marked.error_count, 1);
}
