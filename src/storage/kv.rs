//! Tuple-keyed key/value primitives.
//!
//! Every entity row and secondary-index entry lives in the `kv` table as
//! `(namespace, tuple-key) → JSON`. Multi-part keys join their segments
//! with an ASCII unit separator, which cannot appear in URLs or UUIDs.
//! Writes go through [`Txn`] so row + index + queue message commit
//! atomically; [`with_commit_retry`] wraps the whole transaction in the
//! bounded-backoff retry the store contract requires.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;

use super::schema::Store;
use super::types::StoreError;

// ============================================================================
// Namespaces (persisted state layout)
// ============================================================================

pub(crate) const NS_SUBSCRIPTIONS: &str = "subscriptions";
pub(crate) const NS_SUBSCRIPTIONS_BY_TOPIC_CALLBACK: &str = "subscriptions_by_topic_callback";
pub(crate) const NS_FEEDS: &str = "feeds";
pub(crate) const NS_FEEDS_BY_URL: &str = "feeds_by_url";
pub(crate) const NS_FEED_ITEMS: &str = "feed_items";
pub(crate) const NS_FEED_ITEMS_BY_FEED_GUID: &str = "feed_items_by_feed_guid";
pub(crate) const NS_EXTERNAL_SUBSCRIPTIONS: &str = "external_subscriptions";
pub(crate) const NS_EXTERNAL_SUBSCRIPTIONS_BY_TOPIC: &str = "external_subscriptions_by_topic";
pub(crate) const NS_EXTERNAL_SUBSCRIPTIONS_BY_CALLBACK: &str =
    "external_subscriptions_by_callback";
pub(crate) const NS_USER_CALLBACKS: &str = "user_callbacks";
pub(crate) const NS_USER_CALLBACKS_BY_TOPIC_URL: &str = "user_callbacks_by_topic_url";

/// Separator between tuple-key segments. Unit separator never occurs in
/// URLs, UUIDs, or guids taken from parsed feeds.
pub(crate) const KEY_SEP: char = '\u{1f}';

/// Joins tuple-key segments into the stored key form.
pub(crate) fn encode_key(parts: &[&str]) -> String {
    parts.join("\u{1f}")
}

/// Escapes LIKE metacharacters so a key prefix matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || c == '%' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Commit retry
// ============================================================================

/// Runs a transactional operation, retrying transient commit failures
/// with exponential backoff (up to 5 retries: 50 ms … 800 ms).
///
/// The closure must be safe to re-run from scratch; it is re-invoked
/// with a fresh transaction on every attempt.
pub(crate) async fn with_commit_retry<T, Fut>(
    mut op: impl FnMut() -> Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < 5 && err.is_retryable() => {
                let delay = Duration::from_millis(50 * 2u64.pow(attempt));
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying storage commit"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Read primitives
// ============================================================================

impl Store {
    pub(crate) async fn kv_get(&self, ns: &str, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT v FROM kv WHERE ns = ? AND k = ?")
            .bind(ns)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// All `(key, value)` pairs in a namespace, key-ordered.
    pub(crate) async fn kv_list(&self, ns: &str) -> Result<Vec<(String, String)>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT k, v FROM kv WHERE ns = ? ORDER BY k")
                .bind(ns)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Pairs whose key starts with the encoded prefix segments followed
    /// by the segment separator.
    pub(crate) async fn kv_list_prefix(
        &self,
        ns: &str,
        prefix_parts: &[&str],
    ) -> Result<Vec<(String, String)>, StoreError> {
        let mut prefix = encode_key(prefix_parts);
        prefix.push(KEY_SEP);
        let pattern = format!("{}%", escape_like(&prefix));
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT k, v FROM kv WHERE ns = ? AND k LIKE ? ESCAPE '\\' ORDER BY k")
                .bind(ns)
                .bind(pattern)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Begin a write transaction.
    pub async fn begin(&self) -> Result<Txn<'_>, StoreError> {
        Ok(Txn {
            tx: self.pool.begin().await?,
        })
    }
}

// ============================================================================
// Write transaction
// ============================================================================

/// A write transaction over the kv and queue tables.
///
/// Entity modules layer typed helpers on top; everything staged here
/// becomes visible atomically at [`Txn::commit`].
pub struct Txn<'a> {
    pub(crate) tx: sqlx::Transaction<'a, sqlx::Sqlite>,
}

impl Txn<'_> {
    /// Unconditional write (insert or replace).
    pub(crate) async fn put(&mut self, ns: &str, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO kv (ns, k, v) VALUES (?, ?, ?) ON CONFLICT (ns, k) DO UPDATE SET v = excluded.v")
            .bind(ns)
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Compare-and-set on absence: fails with `Conflict` if the key
    /// already exists.
    pub(crate) async fn insert_new(
        &mut self,
        ns: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("INSERT INTO kv (ns, k, v) VALUES (?, ?, ?) ON CONFLICT DO NOTHING")
                .bind(ns)
                .bind(key)
                .bind(value)
                .execute(&mut *self.tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("{ns}/{key}")));
        }
        Ok(())
    }

    /// Replaces a value only if the stored value still equals `expected`.
    /// Returns false when a concurrent writer got there first.
    pub(crate) async fn compare_and_swap(
        &mut self,
        ns: &str,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE kv SET v = ? WHERE ns = ? AND k = ? AND v = ?")
            .bind(value)
            .bind(ns)
            .bind(key)
            .bind(expected)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub(crate) async fn delete(&mut self, ns: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE ns = ? AND k = ?")
            .bind(ns)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// The atomic-enqueue primitive: stages a queue row inside this
    /// transaction so the message and the mutation land together.
    ///
    /// Returns false when a `dedup_key` collision suppressed the insert
    /// (an identical message is already queued or in flight).
    pub(crate) async fn enqueue_raw(
        &mut self,
        payload: &str,
        delay_ms: i64,
        backoff_ms: &str,
        dedup_key: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO queue (payload, dedup_key, attempt, backoff_ms, available_at, created_at)
            VALUES (?, ?, 0, ?, ?, ?)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(payload)
        .bind(dedup_key)
        .bind(backoff_ms)
        .bind(now + delay_ms)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let s = store().await;
        let mut txn = s.begin().await.unwrap();
        txn.put("feeds", "abc", r#"{"x":1}"#).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(
            s.kv_get("feeds", "abc").await.unwrap().as_deref(),
            Some(r#"{"x":1}"#)
        );
        assert_eq!(s.kv_get("feeds", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_new_conflicts() {
        let s = store().await;
        let mut txn = s.begin().await.unwrap();
        txn.insert_new("feeds", "abc", "1").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = s.begin().await.unwrap();
        let err = txn.insert_new("feeds", "abc", "2").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let s = store().await;
        let mut txn = s.begin().await.unwrap();
        txn.put("feeds", "abc", "old").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = s.begin().await.unwrap();
        assert!(txn.compare_and_swap("feeds", "abc", "old", "new").await.unwrap());
        assert!(!txn.compare_and_swap("feeds", "abc", "old", "newer").await.unwrap());
        txn.commit().await.unwrap();

        assert_eq!(s.kv_get("feeds", "abc").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_list_prefix_matches_segment_boundary() {
        let s = store().await;
        let mut txn = s.begin().await.unwrap();
        let k1 = encode_key(&["feed-1", "guid-a"]);
        let k2 = encode_key(&["feed-1", "guid-b"]);
        let k3 = encode_key(&["feed-10", "guid-c"]);
        txn.put("feed_items_by_feed_guid", &k1, "1").await.unwrap();
        txn.put("feed_items_by_feed_guid", &k2, "2").await.unwrap();
        txn.put("feed_items_by_feed_guid", &k3, "3").await.unwrap();
        txn.commit().await.unwrap();

        // "feed-1" must not match "feed-10": the separator bounds it.
        let rows = s
            .kv_list_prefix("feed_items_by_feed_guid", &["feed-1"])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_list_prefix_escapes_like_metacharacters() {
        let s = store().await;
        let mut txn = s.begin().await.unwrap();
        let k = encode_key(&["https://ex.com/a%b_c", "cb"]);
        txn.put("subscriptions_by_topic_callback", &k, "1")
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let rows = s
            .kv_list_prefix("subscriptions_by_topic_callback", &["https://ex.com/a%b_c"])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        // The unescaped pattern would match this, the escaped one must not.
        let rows = s
            .kv_list_prefix("subscriptions_by_topic_callback", &["https://ex.com/aXb_c"])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_dedup() {
        let s = store().await;
        let mut txn = s.begin().await.unwrap();
        assert!(txn.enqueue_raw("{}", 0, "[]", Some("poll:f1")).await.unwrap());
        assert!(!txn.enqueue_raw("{}", 0, "[]", Some("poll:f1")).await.unwrap());
        assert!(txn.enqueue_raw("{}", 0, "[]", None).await.unwrap());
        assert!(txn.enqueue_raw("{}", 0, "[]", None).await.unwrap());
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let s = store().await;
        let txn = {
            let mut txn = s.begin().await.unwrap();
            txn.put("feeds", "abc", "1").await.unwrap();
            txn
        };
        drop(txn); // rollback

        assert_eq!(s.kv_get("feeds", "abc").await.unwrap(), None);
    }
}
