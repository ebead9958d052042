//! Typed key/value persistence with secondary indexes.
//!
//! The [`Store`] wraps SQLite through sqlx: one `kv` table keyed by
//! `(namespace, tuple-key)` holds entity rows (JSON) and index entries,
//! and the queue tables share the pool so mutations and queue messages
//! commit atomically. Entity operations live in per-entity modules as
//! impl blocks on `Store`.

mod external;
mod feeds;
mod kv;
mod schema;
mod subscriptions;
mod types;

pub use kv::Txn;
pub(crate) use kv::with_commit_retry;
pub use schema::Store;
pub use types::{
    ExternalSubscription, Feed, FeedItem, ItemUpsert, StoreError, Subscription, UserCallback,
};
