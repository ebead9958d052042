//! Durable at-least-once task queue.
//!
//! Messages are a tagged union persisted in the `queue` table alongside
//! the kv store, so enqueues can commit in the same transaction as the
//! mutation that caused them. Delivery uses visibility timeouts: a
//! claimed message that is never acked becomes claimable again, which is
//! what makes restart recovery work. Retries follow a per-message
//! backoff schedule; messages that exhaust it are moved to the
//! `queue_dead` table with their final error.

mod worker;

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::Txn;

pub use worker::{Dispatcher, HandlerError, Worker};

// ============================================================================
// Messages
// ============================================================================

/// Verification direction for a pending subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    Subscribe,
    Unsubscribe,
}

impl VerifyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyMode::Subscribe => "subscribe",
            VerifyMode::Unsubscribe => "unsubscribe",
        }
    }
}

/// The queue's payload union. Handlers are idempotent: the store is the
/// source of truth and a repeat delivery short-circuits on terminal
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    /// Trigger one poll of one feed.
    PollFeed { feed_id: Uuid },
    /// Deliver one content payload to one subscriber.
    Distribute {
        subscription_id: Uuid,
        topic: String,
        content_type: String,
        body: Vec<u8>,
    },
    /// Execute a verification GET against a subscriber's callback.
    Verify {
        subscription_id: Uuid,
        mode: VerifyMode,
        topic: String,
        challenge: String,
        token: String,
        lease_seconds: Option<u32>,
    },
    /// Refresh an outbound subscription's lease.
    Renew { external_subscription_id: Uuid },
    /// Forward external content to a user-provided URL.
    RelayToUserCallback {
        user_callback_id: Uuid,
        content_type: String,
        body: Vec<u8>,
    },
}

impl QueueMessage {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueMessage::PollFeed { .. } => "poll_feed",
            QueueMessage::Distribute { .. } => "distribute",
            QueueMessage::Verify { .. } => "verify",
            QueueMessage::Renew { .. } => "renew",
            QueueMessage::RelayToUserCallback { .. } => "relay_to_user_callback",
        }
    }
}

// ============================================================================
// Errors and options
// ============================================================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),
}

/// Per-enqueue options: initial delay, retry schedule, dedup key.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    /// Per-attempt retry delays; total attempts = `backoff.len() + 1`.
    /// `None` uses [`Queue::DEFAULT_BACKOFF`].
    pub backoff: Option<Vec<Duration>>,
    /// When set, an identical queued or in-flight message suppresses
    /// this enqueue (per-feed poll exclusion relies on this).
    pub dedup_key: Option<String>,
}

impl EnqueueOptions {
    pub fn deduped(key: String) -> Self {
        Self {
            dedup_key: Some(key),
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

/// A serialized message ready to stage into a storage transaction.
#[derive(Debug, Clone)]
pub struct PreparedEnqueue {
    payload: String,
    backoff: String,
    delay_ms: i64,
    dedup_key: Option<String>,
}

impl PreparedEnqueue {
    /// Stage the message into the transaction. Returns false when a
    /// dedup key suppressed it.
    pub async fn stage(&self, txn: &mut Txn<'_>) -> Result<bool, crate::storage::StoreError> {
        txn.enqueue_raw(
            &self.payload,
            self.delay_ms,
            &self.backoff,
            self.dedup_key.as_deref(),
        )
        .await
    }
}

/// A message claimed for processing.
#[derive(Debug)]
pub struct Claimed {
    pub id: i64,
    pub message: QueueMessage,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    backoff_ms: Vec<i64>,
}

impl Claimed {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Handle over the queue tables. Cloneable; shares the store's pool.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    visibility: Duration,
}

impl Queue {
    /// Default retry schedule: 1 s, 10 s, 60 s, 600 s.
    pub const DEFAULT_BACKOFF: [Duration; 4] = [
        Duration::from_secs(1),
        Duration::from_secs(10),
        Duration::from_secs(60),
        Duration::from_secs(600),
    ];

    pub fn new(pool: SqlitePool, visibility: Duration) -> Self {
        Self { pool, visibility }
    }

    fn backoff_json(options: &EnqueueOptions) -> Result<String, QueueError> {
        let schedule: Vec<i64> = options
            .backoff
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_BACKOFF.to_vec())
            .iter()
            .map(|d| d.as_millis() as i64)
            .collect();
        Ok(serde_json::to_string(&schedule)?)
    }

    /// Enqueue in its own transaction. Returns false when a dedup key
    /// suppressed the message.
    pub async fn enqueue(
        &self,
        message: &QueueMessage,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let payload = serde_json::to_string(message)?;
        let backoff = Self::backoff_json(&options)?;
        let delay_ms = options.delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO queue (payload, dedup_key, attempt, backoff_ms, available_at, created_at)
            VALUES (?, ?, 0, ?, ?, ?)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(&payload)
        .bind(options.dedup_key.as_deref())
        .bind(&backoff)
        .bind(now + delay_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Serialize a message ahead of a storage transaction. The returned
    /// [`PreparedEnqueue`] stages with only storage errors possible, so
    /// it slots into the commit-retry loop cleanly.
    pub fn prepare(
        &self,
        message: &QueueMessage,
        options: EnqueueOptions,
    ) -> Result<PreparedEnqueue, QueueError> {
        Ok(PreparedEnqueue {
            payload: serde_json::to_string(message)?,
            backoff: Self::backoff_json(&options)?,
            delay_ms: options.delay.map(|d| d.as_millis() as i64).unwrap_or(0),
            dedup_key: options.dedup_key,
        })
    }

    /// Enqueue inside a storage transaction, so the message commits
    /// atomically with the mutation that produced it.
    pub async fn enqueue_in(
        &self,
        txn: &mut Txn<'_>,
        message: &QueueMessage,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let prepared = self.prepare(message, options)?;
        Ok(prepared.stage(txn).await?)
    }

    /// Claim the next available message, extending its visibility
    /// deadline. Returns `None` when nothing is due.
    pub async fn claim(&self) -> Result<Option<Claimed>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let visibility_ms = self.visibility.as_millis() as i64;

        let candidate: Option<(i64, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT id, payload, attempt, backoff_ms FROM queue
            WHERE available_at <= ? AND (claimed_until IS NULL OR claimed_until <= ?)
            ORDER BY available_at, id
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let (id, payload, attempt, backoff) = match candidate {
            Some(row) => row,
            None => return Ok(None),
        };

        // Guarded claim: a concurrent worker may have won the row.
        let claimed = sqlx::query(
            r#"
            UPDATE queue SET claimed_until = ?, attempt = attempt + 1
            WHERE id = ? AND (claimed_until IS NULL OR claimed_until <= ?)
            "#,
        )
        .bind(now + visibility_ms)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let message: QueueMessage = serde_json::from_str(&payload)?;
        let backoff_ms: Vec<i64> = serde_json::from_str(&backoff)?;
        let max_attempts = backoff_ms.len() as u32 + 1;

        Ok(Some(Claimed {
            id,
            message,
            attempt: attempt as u32 + 1,
            max_attempts,
            backoff_ms,
        }))
    }

    /// Acknowledge successful processing: the message is gone.
    pub async fn ack(&self, claimed: &Claimed) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(claimed.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt: requeue after the scheduled delay, or
    /// bury in the dead-letter table once the budget is spent.
    pub async fn fail(&self, claimed: &Claimed, error: &str) -> Result<(), QueueError> {
        if claimed.is_final_attempt() {
            self.bury(claimed, error).await
        } else {
            let delay_ms = claimed
                .backoff_ms
                .get(claimed.attempt as usize - 1)
                .copied()
                .unwrap_or(60_000);
            let now = Utc::now().timestamp_millis();
            sqlx::query(
                "UPDATE queue SET available_at = ?, claimed_until = NULL WHERE id = ?",
            )
            .bind(now + delay_ms)
            .bind(claimed.id)
            .execute(&self.pool)
            .await?;
            tracing::debug!(
                message = claimed.message.kind(),
                attempt = claimed.attempt,
                delay_ms,
                error,
                "Requeued message after failure"
            );
            Ok(())
        }
    }

    /// Move a message to the dead-letter table.
    pub async fn bury(&self, claimed: &Claimed, error: &str) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&claimed.message)?;
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO queue_dead (payload, attempts, last_error, failed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&payload)
        .bind(claimed.attempt as i64)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(claimed.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::warn!(
            message = claimed.message.kind(),
            attempts = claimed.attempt,
            error,
            "Buried message in dead-letter table"
        );
        Ok(())
    }

    /// Number of queued (not dead) messages.
    pub async fn depth(&self) -> Result<i64, QueueError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Number of dead-lettered messages.
    pub async fn dead_count(&self) -> Result<i64, QueueError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_dead")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
