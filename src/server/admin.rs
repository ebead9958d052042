//! Admin read API: projections over the Store plus a manual poll
//! trigger. Filtering and ordering live here, not in the core.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::AppState;
use crate::storage::{Feed, FeedItem, Subscription};

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedView {
    pub id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub polling_interval_minutes: u32,
    pub active: bool,
    pub supports_websub: bool,
    pub websub_hub: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl From<Feed> for FeedView {
    fn from(feed: Feed) -> Self {
        Self {
            id: feed.id,
            url: feed.url,
            title: feed.title,
            description: feed.description,
            last_fetched: feed.last_fetched,
            last_updated: feed.last_updated,
            polling_interval_minutes: feed.polling_interval_minutes,
            active: feed.active,
            supports_websub: feed.supports_websub,
            websub_hub: feed.websub_hub,
            error_count: feed.error_count,
            last_error: feed.last_error,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItemView {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub guid: String,
    pub url: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
}

impl From<FeedItem> for FeedItemView {
    fn from(item: FeedItem) -> Self {
        Self {
            id: item.id,
            feed_id: item.feed_id,
            guid: item.guid,
            url: item.url,
            title: item.title,
            author: item.author,
            published: item.published,
            updated: item.updated,
            categories: item.categories,
        }
    }
}

/// Subscription projection; the shared secret never leaves the store.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: Uuid,
    pub topic: String,
    pub callback: String,
    pub lease_seconds: u32,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub verified: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl From<Subscription> for SubscriptionView {
    fn from(sub: Subscription) -> Self {
        Self {
            id: sub.id,
            topic: sub.topic,
            callback: sub.callback,
            lease_seconds: sub.lease_seconds,
            created: sub.created,
            expires: sub.expires,
            verified: sub.verified,
            error_count: sub.error_count,
            last_error: sub.last_error,
        }
    }
}

fn storage_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "success": false, "message": err.to_string() })),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "success": false, "message": "not found" })),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// `GET /api/feeds?status=active|inactive|error&url=…&title=…`
pub async fn list_feeds(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let feeds = match state.store.list_feeds().await {
        Ok(feeds) => feeds,
        Err(err) => return storage_error(err),
    };

    let status = params.get("status").map(String::as_str);
    let url_filter = params.get("url").map(|s| s.to_lowercase());
    let title_filter = params.get("title").map(|s| s.to_lowercase());

    let mut views: Vec<FeedView> = feeds
        .into_iter()
        .filter(|feed| match status {
            Some("active") => feed.active,
            Some("inactive") => !feed.active,
            Some("error") => feed.error_count > 0,
            _ => true,
        })
        .filter(|feed| {
            url_filter
                .as_ref()
                .map(|needle| feed.url.to_lowercase().contains(needle))
                .unwrap_or(true)
        })
        .filter(|feed| {
            title_filter
                .as_ref()
                .map(|needle| {
                    feed.title
                        .as_ref()
                        .map(|t| t.to_lowercase().contains(needle))
                        .unwrap_or(false)
                })
                .unwrap_or(true)
        })
        .map(FeedView::from)
        .collect();
    views.sort_by(|a, b| a.url.cmp(&b.url));

    Json(views).into_response()
}

pub async fn get_feed(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.feed(id).await {
        Ok(Some(feed)) => Json(FeedView::from(feed)).into_response(),
        Ok(None) => not_found(),
        Err(err) => storage_error(err),
    }
}

/// `GET /api/feeds/:id/items?limit=…` — newest first, default 50.
pub async fn feed_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = params
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(50);

    match state.store.feed(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(err) => return storage_error(err),
    }

    match state.store.items_for_feed(id, limit).await {
        Ok(items) => {
            let views: Vec<FeedItemView> = items.into_iter().map(FeedItemView::from).collect();
            Json(views).into_response()
        }
        Err(err) => storage_error(err),
    }
}

/// `POST /api/feeds/:id/toggle` — flip `active`. Re-activating a feed
/// that upgraded to WebSub resets the upgrade, putting it back into the
/// polling set.
pub async fn toggle_feed(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let feed = match state.store.feed(id).await {
        Ok(Some(feed)) => feed,
        Ok(None) => return not_found(),
        Err(err) => return storage_error(err),
    };

    let mut toggled = feed.clone();
    toggled.active = !feed.active;
    if toggled.active && toggled.supports_websub {
        tracing::info!(feed_id = %id, "Operator reset: feed re-enters the polling set");
        toggled.supports_websub = false;
        toggled.websub_hub = None;
    }

    match state.store.update_feed_guarded(&feed, &toggled).await {
        Ok(true) => Json(FeedView::from(toggled)).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "success": false, "message": "feed changed concurrently, retry" })),
        )
            .into_response(),
        Err(err) => storage_error(err),
    }
}

/// `POST /api/feeds/:id/poll` — force-enqueue one poll.
pub async fn poll_feed(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.feed(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(err) => return storage_error(err),
    }

    match state.poller.force_poll(id).await {
        Ok(queued) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "success": true, "queued": queued })),
        )
            .into_response(),
        Err(err) => storage_error(err),
    }
}

/// `GET /api/subscriptions?topic=…`
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let subs = match state.store.list_subscriptions().await {
        Ok(subs) => subs,
        Err(err) => return storage_error(err),
    };

    let topic = params.get("topic");
    let mut views: Vec<SubscriptionView> = subs
        .into_iter()
        .filter(|sub| topic.map(|t| &sub.topic == t).unwrap_or(true))
        .map(SubscriptionView::from)
        .collect();
    views.sort_by(|a, b| (a.topic.as_str(), a.callback.as_str()).cmp(&(b.topic.as_str(), b.callback.as_str())));

    Json(views).into_response()
}
