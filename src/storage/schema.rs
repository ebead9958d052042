use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::types::StoreError;

// ============================================================================
// Store
// ============================================================================

/// Typed key/value store over SQLite.
///
/// One `kv` table holds every entity row and secondary-index entry,
/// keyed by `(namespace, tuple-key)`; the queue tables live alongside so
/// a mutation and its queue messages commit in one transaction.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Open the store and run migrations.
    ///
    /// Pass `":memory:"` for an ephemeral store (tests); the pool is then
    /// pinned to a single connection so every handle sees the same data.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the file cannot be opened or a
    /// migration fails.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: wait up to 5s for a writer lock before
        // surfacing SQLITE_BUSY; the commit retry loop covers the rest.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::Database)?
            .busy_timeout(Duration::from_millis(5000))
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
        if in_memory {
            // A pooled :memory: database is a different database per
            // connection; pin to one.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(8);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Direct access to the underlying pool (queue tables share it).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                ns TEXT NOT NULL,
                k  TEXT NOT NULL,
                v  TEXT NOT NULL,
                PRIMARY KEY (ns, k)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                payload      TEXT NOT NULL,
                dedup_key    TEXT UNIQUE,
                attempt      INTEGER NOT NULL DEFAULT 0,
                backoff_ms   TEXT NOT NULL,
                available_at INTEGER NOT NULL,
                claimed_until INTEGER,
                created_at   INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_available ON queue (available_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_dead (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                payload    TEXT NOT NULL,
                attempts   INTEGER NOT NULL,
                last_error TEXT,
                failed_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
