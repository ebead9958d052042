use uuid::Uuid;

use super::kv::{
    self, with_commit_retry, Txn, NS_FEEDS, NS_FEEDS_BY_URL, NS_FEED_ITEMS,
    NS_FEED_ITEMS_BY_FEED_GUID,
};
use super::schema::Store;
use super::types::{Feed, FeedItem, ItemUpsert, StoreError};

impl Txn<'_> {
    /// Read a key within this transaction (sees staged writes).
    pub(crate) async fn get(&mut self, ns: &str, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT v FROM kv WHERE ns = ? AND k = ?")
            .bind(ns)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub(crate) async fn put_feed(&mut self, feed: &Feed) -> Result<(), StoreError> {
        let row = serde_json::to_string(feed)?;
        let id = feed.id.to_string();
        self.put(NS_FEEDS, &id, &row).await?;
        self.put(NS_FEEDS_BY_URL, &feed.url, &id).await?;
        Ok(())
    }
}

impl Store {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    pub async fn feed(&self, id: Uuid) -> Result<Option<Feed>, StoreError> {
        match self.kv_get(NS_FEEDS, &id.to_string()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let id = match self.kv_get(NS_FEEDS_BY_URL, url).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.kv_get(NS_FEEDS, &id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let rows = self.kv_list(NS_FEEDS).await?;
        rows.into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(StoreError::from))
            .collect()
    }

    /// Create a feed; the url carries a unique index, so a second create
    /// for the same url fails with `Conflict`.
    pub async fn create_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let row = serde_json::to_string(feed)?;
        let id = feed.id.to_string();
        let (row, id) = (row.as_str(), id.as_str());
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.insert_new(NS_FEEDS, id, row).await?;
            txn.insert_new(NS_FEEDS_BY_URL, &feed.url, id).await?;
            txn.commit().await
        })
        .await
    }

    /// Unconditional feed update. The url is immutable, so the index
    /// entry stays put.
    pub async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.put_feed(feed).await?;
            txn.commit().await
        })
        .await
    }

    /// Guarded feed update: only writes if the stored row still equals
    /// `old`. Returns false when a concurrent writer intervened, in
    /// which case the caller must re-read before retrying.
    pub async fn update_feed_guarded(&self, old: &Feed, new: &Feed) -> Result<bool, StoreError> {
        let expected = serde_json::to_string(old)?;
        let value = serde_json::to_string(new)?;
        let id = old.id.to_string();
        let (expected, value, id) = (expected.as_str(), value.as_str(), id.as_str());
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            let swapped = txn.compare_and_swap(NS_FEEDS, id, expected, value).await?;
            txn.commit().await?;
            Ok(swapped)
        })
        .await
    }

    // ========================================================================
    // Feed Item Operations
    // ========================================================================

    pub async fn feed_item(&self, id: Uuid) -> Result<Option<FeedItem>, StoreError> {
        match self.kv_get(NS_FEED_ITEMS, &id.to_string()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn feed_item_by_guid(
        &self,
        feed_id: Uuid,
        guid: &str,
    ) -> Result<Option<FeedItem>, StoreError> {
        let key = kv::encode_key(&[&feed_id.to_string(), guid]);
        let id = match self.kv_get(NS_FEED_ITEMS_BY_FEED_GUID, &key).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.kv_get(NS_FEED_ITEMS, &id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Upsert one observed entry.
    ///
    /// First sighting of `(feed_id, guid)` creates the row; a known guid
    /// with a strictly newer `updated` overwrites in place under the
    /// existing id; anything else is a no-op.
    pub async fn upsert_feed_item(&self, item: &FeedItem) -> Result<ItemUpsert, StoreError> {
        let index_key = kv::encode_key(&[&item.feed_id.to_string(), &item.guid]);
        let index_key = index_key.as_str();
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            let existing_id = txn.get(NS_FEED_ITEMS_BY_FEED_GUID, index_key).await?;

            let outcome = match existing_id {
                None => {
                    let row = serde_json::to_string(item)?;
                    let id = item.id.to_string();
                    txn.insert_new(NS_FEED_ITEMS, &id, &row).await?;
                    txn.insert_new(NS_FEED_ITEMS_BY_FEED_GUID, index_key, &id)
                        .await?;
                    ItemUpsert::Created
                }
                Some(id) => {
                    let raw = txn.get(NS_FEED_ITEMS, &id).await?;
                    let current: FeedItem = match raw {
                        Some(raw) => serde_json::from_str(&raw)?,
                        // Dangling index entry; repair by rewriting both.
                        None => {
                            let mut repaired = item.clone();
                            repaired.id = id.parse().unwrap_or(item.id);
                            let row = serde_json::to_string(&repaired)?;
                            txn.put(NS_FEED_ITEMS, &id, &row).await?;
                            txn.commit().await?;
                            return Ok(ItemUpsert::Created);
                        }
                    };

                    let newer = match (item.updated, current.updated) {
                        (Some(incoming), Some(stored)) => incoming > stored,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    if newer {
                        let mut replacement = item.clone();
                        replacement.id = current.id;
                        let row = serde_json::to_string(&replacement)?;
                        txn.put(NS_FEED_ITEMS, &id, &row).await?;
                        ItemUpsert::Updated
                    } else {
                        ItemUpsert::Skipped
                    }
                }
            };

            txn.commit().await?;
            Ok(outcome)
        })
        .await
    }

    /// Items for one feed, newest first by `updated`/`published`.
    pub async fn items_for_feed(
        &self,
        feed_id: Uuid,
        limit: usize,
    ) -> Result<Vec<FeedItem>, StoreError> {
        let ids = self
            .kv_list_prefix(NS_FEED_ITEMS_BY_FEED_GUID, &[&feed_id.to_string()])
            .await?;
        let mut items = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(raw) = self.kv_get(NS_FEED_ITEMS, &id).await? {
                items.push(serde_json::from_str::<FeedItem>(&raw)?);
            }
        }
        items.sort_by_key(|i| std::cmp::Reverse(i.updated.or(i.published)));
        items.truncate(limit);
        Ok(items)
    }
}
