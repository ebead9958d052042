use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A create hit an existing row or index entry for the same key.
    #[error("Row already exists: {0}")]
    Conflict(String),

    /// A guarded update observed a concurrent modification.
    #[error("Concurrent modification: {0}")]
    Contention(String),

    /// Entity (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True for transient failures worth retrying with backoff.
    ///
    /// SQLite reports contention as lock errors; conflicts and
    /// serialization failures are deterministic and never retried.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(err) => {
                let error_string = err.to_string().to_lowercase();
                // SQLITE_BUSY (5): database is locked
                // SQLITE_LOCKED (6): database table is locked
                error_string.contains("database is locked")
                    || error_string.contains("database table is locked")
                    || error_string.contains("sqlite_busy")
                    || error_string.contains("sqlite_locked")
            }
            _ => false,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// An inbound subscription: a subscriber's callback registered with this
/// hub for one topic.
///
/// Unique per `(topic, callback)` via a secondary index. `expires` is
/// `created + lease_seconds` at creation and is recomputed when
/// verification succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub topic: String,
    pub callback: String,
    pub secret: Option<String>,
    pub lease_seconds: u32,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    /// Transitions false → true exactly once; a failed unsubscribe
    /// verification deletes the row instead.
    pub verified: bool,
    pub verification_token: Option<String>,
    pub verification_expires: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

/// A polled source of record.
///
/// Feeds with `supports_websub = true` are never selected by the polling
/// engine; the upstream hub pushes instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    /// Last time new content was observed (not merely fetched).
    pub last_updated: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// RFC 1123 string, echoed back as `If-Modified-Since`.
    pub last_modified: Option<String>,
    pub polling_interval_minutes: u32,
    pub active: bool,
    pub supports_websub: bool,
    pub websub_hub: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Entry guid at which enumeration short-circuits on the next poll.
    pub last_processed_entry_id: Option<String>,
}

/// One observed entry of a feed, unique per `(feed_id, guid)`.
///
/// Re-observing an entry with a strictly newer `updated` overwrites the
/// row in place (same id); anything older is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
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

/// An outbound subscription: this process subscribed to an upstream hub
/// (or fell back to polling) on a user's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSubscription {
    pub id: Uuid,
    pub topic: String,
    /// The upstream hub; absent when `using_fallback`.
    pub hub: Option<String>,
    /// Unique per process, `/callback/<uuid>`.
    pub callback_path: String,
    pub secret: String,
    pub lease_seconds: u32,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub verified: bool,
    pub last_renewed: Option<DateTime<Utc>>,
    /// True iff no external hub was found and polling stands in.
    pub using_fallback: bool,
    pub user_callback_url: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// An external URL that wants content forwarded to it, unique per
/// `(topic, callback_url)`.
///
/// Unverified rows whose token expired (24 h) are purged by the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCallback {
    pub id: Uuid,
    pub topic: String,
    pub callback_url: String,
    pub verified: bool,
    pub verification_token: Option<String>,
    pub verification_expires: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Outcome of a feed-item upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemUpsert {
    /// First sighting of this `(feed_id, guid)`.
    Created,
    /// Known guid re-observed with a newer `updated`; row overwritten.
    Updated,
    /// Known guid with no newer `updated`; ignored.
    Skipped,
}
