//! The fallback polling engine.
//!
//! Feeds without a WebSub hub are fetched on a schedule with
//! conditional GETs. New entries are deduplicated by `(feed, guid)`,
//! upserted, and a synthesized content notification hands the original
//! body to the hub engine for fan-out. Polls run off the queue (one
//! deduped `PollFeed` message per feed) so retries and backpressure
//! come for free and no two polls of the same feed overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::hub::{HubError, HubService};
use crate::queue::{EnqueueOptions, HandlerError, Queue, QueueMessage};
use crate::storage::{Feed, FeedItem, ItemUpsert, Store, StoreError};

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Maximum jitter subtracted from a feed's effective deadline, so feeds
/// sharing a deadline spread out instead of stampeding.
const POLL_JITTER_SECS: i64 = 300;

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum PollError {
    #[error("fetch failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("fetch timed out")]
    Timeout,

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("response too large")]
    TooLarge,

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// What a single poll accomplished.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Upstream answered 304; nothing to do.
    NotModified,
    /// Body processed; `new_items` entries were first sightings.
    Processed { new_items: usize },
    /// The feed advertised a hub; it leaves the polling set.
    UpgradedToWebSub { new_items: usize },
}

// ============================================================================
// Service
// ============================================================================

/// The polling engine.
pub struct Poller {
    store: Store,
    queue: Queue,
    hub: Arc<HubService>,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl Poller {
    pub fn new(
        store: Store,
        queue: Queue,
        hub: Arc<HubService>,
        http: reqwest::Client,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            queue,
            hub,
            http,
            config,
        }
    }

    // ========================================================================
    // Due set
    // ========================================================================

    /// Feeds due for a poll right now, with per-feed jitter applied.
    pub async fn due_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let now = Utc::now();
        let feeds = self.store.list_feeds().await?;
        // ThreadRng is not Send; keep it strictly between awaits.
        let mut rng = rand::thread_rng();
        let feeds = feeds
            .into_iter()
            .filter(|feed| {
                if !feed.active || feed.supports_websub {
                    return false;
                }
                match feed.last_fetched {
                    None => true,
                    Some(last) => {
                        let jitter = chrono::Duration::seconds(rng.gen_range(0..=POLL_JITTER_SECS));
                        let interval =
                            chrono::Duration::minutes(i64::from(feed.polling_interval_minutes));
                        last - jitter + interval <= now
                    }
                }
            })
            .collect();
        Ok(feeds)
    }

    /// Scheduler tick: enqueue one deduped `PollFeed` per due feed.
    /// Returns how many messages were actually queued.
    pub async fn enqueue_due(&self) -> Result<usize, HandlerError> {
        let mut queued = 0usize;
        for feed in self.due_feeds().await? {
            let fresh = self
                .queue
                .enqueue(
                    &QueueMessage::PollFeed { feed_id: feed.id },
                    EnqueueOptions::deduped(format!("poll:{}", feed.id)),
                )
                .await?;
            if fresh {
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::debug!(queued, "Enqueued due feed polls");
        }
        Ok(queued)
    }

    /// Admin force-poll: queue a poll regardless of the schedule.
    pub async fn force_poll(&self, feed_id: Uuid) -> Result<bool, HandlerError> {
        Ok(self
            .queue
            .enqueue(
                &QueueMessage::PollFeed { feed_id },
                EnqueueOptions::deduped(format!("poll:{feed_id}")),
            )
            .await?)
    }

    // ========================================================================
    // Poll handler
    // ========================================================================

    /// Queue handler for `PollFeed`. Deleted, deactivated, or upgraded
    /// feeds drop the message; upstream failures requeue per backoff.
    pub async fn handle_poll(&self, feed_id: Uuid) -> Result<(), HandlerError> {
        let feed = match self.store.feed(feed_id).await? {
            Some(feed) if feed.active && !feed.supports_websub => feed,
            _ => return Ok(()),
        };

        match self.poll_feed(feed).await {
            Ok(outcome) => {
                tracing::debug!(feed_id = %feed_id, outcome = ?outcome, "Poll complete");
                Ok(())
            }
            Err(err) => Err(HandlerError::retry(err)),
        }
    }

    /// Poll one feed: conditional GET, parse, dedup entries, persist,
    /// and synthesize a content notification when anything is new.
    pub async fn poll_feed(&self, feed: Feed) -> Result<PollOutcome, PollError> {
        let mut request = self.http.get(&feed.url);
        if let Some(etag) = &feed.etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &feed.last_modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }

        let timeout = Duration::from_secs(self.config.feed_fetch_timeout_secs);
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.record_poll_failure(&feed, &format!("fetch failed: {err}"))
                    .await?;
                return Err(PollError::Network(err));
            }
            Err(_) => {
                self.record_poll_failure(&feed, "fetch timed out").await?;
                return Err(PollError::Timeout);
            }
        };

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            let mut next = feed.clone();
            next.last_fetched = Some(Utc::now());
            next.error_count = 0;
            next.last_error = None;
            next.last_error_time = None;
            self.commit_feed(&feed, next).await?;
            return Ok(PollOutcome::NotModified);
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            self.record_poll_failure(&feed, &format!("HTTP status {status}"))
                .await?;
            return Err(PollError::HttpStatus(status));
        }

        let etag = header_string(&response, reqwest::header::ETAG);
        let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED);
        let content_type = header_string(&response, reqwest::header::CONTENT_TYPE)
            .unwrap_or_else(|| "application/rss+xml".to_owned());

        let body = match read_limited(response).await {
            Ok(body) => body,
            Err(err) => {
                self.record_poll_failure(&feed, &err.to_string()).await?;
                return Err(err);
            }
        };

        let parsed = match crate::feed::parse_feed(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.record_poll_failure(&feed, &err.to_string()).await?;
                return Err(PollError::Parse(err.to_string()));
            }
        };

        // Enumerate in feed order, short-circuiting at the last entry
        // already processed in a previous cycle.
        let mut new_items = 0usize;
        let mut observed: Vec<&crate::feed::ParsedEntry> = Vec::new();
        for entry in &parsed.entries {
            let guid = match &entry.guid {
                Some(guid) => guid,
                None => continue,
            };
            if feed.last_processed_entry_id.as_deref() == Some(guid.as_str()) {
                break;
            }
            observed.push(entry);

            let item = FeedItem {
                id: Uuid::new_v4(),
                feed_id: feed.id,
                guid: guid.clone(),
                url: entry.url.clone(),
                title: entry.title.clone(),
                author: entry.author.clone(),
                published: entry.published,
                updated: entry.updated,
                categories: entry.categories.clone(),
            };
            if self.store.upsert_feed_item(&item).await? == ItemUpsert::Created {
                new_items += 1;
            }
        }

        let latest_guid = observed
            .iter()
            .max_by_key(|e| e.updated.or(e.published))
            .and_then(|e| e.guid.clone());

        let now = Utc::now();
        let mut next = feed.clone();
        next.last_fetched = Some(now);
        next.etag = etag;
        next.last_modified = last_modified;
        if parsed.title.is_some() {
            next.title = parsed.title.clone();
        }
        if parsed.description.is_some() {
            next.description = parsed.description.clone();
        }
        if let Some(hub_url) = &parsed.hub_url {
            next.supports_websub = true;
            next.websub_hub = Some(hub_url.clone());
            tracing::info!(
                feed_id = %feed.id,
                url = %feed.url,
                hub = %hub_url,
                "Feed advertises WebSub; leaving the polling set"
            );
        }
        if let Some(guid) = latest_guid {
            next.last_processed_entry_id = Some(guid);
        }
        if new_items > 0 {
            next.last_updated = Some(now);
        }
        next.error_count = 0;
        next.last_error = None;
        next.last_error_time = None;

        let upgraded = next.supports_websub;
        self.commit_feed(&feed, next).await?;

        if new_items > 0 {
            self.hub
                .process_content_notification(&feed.url, &body, &content_type)
                .await?;
        }

        if upgraded {
            Ok(PollOutcome::UpgradedToWebSub { new_items })
        } else {
            Ok(PollOutcome::Processed { new_items })
        }
    }

    // ========================================================================
    // Row commits
    // ========================================================================

    /// Commit poll results against the snapshot we fetched with. On
    /// contention (an admin toggled the feed mid-poll), re-read and
    /// re-apply only the poll-owned fields, preserving the other
    /// writer's.
    async fn commit_feed(&self, snapshot: &Feed, next: Feed) -> Result<(), StoreError> {
        if self.store.update_feed_guarded(snapshot, &next).await? {
            return Ok(());
        }

        for _ in 0..3 {
            let fresh = match self.store.feed(snapshot.id).await? {
                Some(fresh) => fresh,
                None => return Ok(()),
            };
            let mut merged = fresh.clone();
            merged.last_fetched = next.last_fetched;
            merged.last_updated = next.last_updated.or(fresh.last_updated);
            merged.etag = next.etag.clone();
            merged.last_modified = next.last_modified.clone();
            merged.title = next.title.clone().or(fresh.title.clone());
            merged.description = next.description.clone().or(fresh.description.clone());
            merged.supports_websub = merged.supports_websub || next.supports_websub;
            merged.websub_hub = next.websub_hub.clone().or(fresh.websub_hub.clone());
            merged.last_processed_entry_id = next
                .last_processed_entry_id
                .clone()
                .or(fresh.last_processed_entry_id.clone());
            merged.error_count = next.error_count;
            merged.last_error = next.last_error.clone();
            merged.last_error_time = next.last_error_time;

            if self.store.update_feed_guarded(&fresh, &merged).await? {
                return Ok(());
            }
        }

        Err(StoreError::Contention(format!("feed {}", snapshot.id)))
    }

    async fn record_poll_failure(&self, feed: &Feed, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut next = feed.clone();
        next.last_fetched = Some(now);
        next.error_count = feed.error_count.saturating_add(1);
        next.last_error = Some(reason.to_owned());
        next.last_error_time = Some(now);
        self.commit_feed(feed, next).await?;
        tracing::warn!(
            feed_id = %feed.id,
            url = %feed.url,
            error_count = feed.error_count + 1,
            reason,
            "Feed poll failed"
        );
        Ok(())
    }
}

/// Reads a response body with the feed size limit.
async fn read_limited(response: reqwest::Response) -> Result<Vec<u8>, PollError> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_FEED_SIZE {
            return Err(PollError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(PollError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > MAX_FEED_SIZE {
            return Err(PollError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
}
