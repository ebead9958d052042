use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::kv::{
    self, with_commit_retry, Txn, NS_SUBSCRIPTIONS, NS_SUBSCRIPTIONS_BY_TOPIC_CALLBACK,
};
use super::schema::Store;
use super::types::{StoreError, Subscription};

impl Txn<'_> {
    /// Stage a subscription row and its `(topic, callback)` index entry.
    pub(crate) async fn put_subscription(&mut self, sub: &Subscription) -> Result<(), StoreError> {
        let row = serde_json::to_string(sub)?;
        let id = sub.id.to_string();
        self.put(NS_SUBSCRIPTIONS, &id, &row).await?;
        self.put(
            NS_SUBSCRIPTIONS_BY_TOPIC_CALLBACK,
            &kv::encode_key(&[&sub.topic, &sub.callback]),
            &id,
        )
        .await?;
        Ok(())
    }

    /// Stage deletion of a subscription row and its index entry.
    pub(crate) async fn delete_subscription(&mut self, sub: &Subscription) -> Result<(), StoreError> {
        self.delete(NS_SUBSCRIPTIONS, &sub.id.to_string()).await?;
        self.delete(
            NS_SUBSCRIPTIONS_BY_TOPIC_CALLBACK,
            &kv::encode_key(&[&sub.topic, &sub.callback]),
        )
        .await?;
        Ok(())
    }
}

impl Store {
    // ========================================================================
    // Subscription Operations
    // ========================================================================

    pub async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        match self.kv_get(NS_SUBSCRIPTIONS, &id.to_string()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn subscription_by_topic_callback(
        &self,
        topic: &str,
        callback: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let key = kv::encode_key(&[topic, callback]);
        let id = match self.kv_get(NS_SUBSCRIPTIONS_BY_TOPIC_CALLBACK, &key).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.kv_get(NS_SUBSCRIPTIONS, &id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Verified subscriptions for one topic, in callback order (the
    /// fan-out set for a content notification).
    pub async fn verified_subscriptions_for_topic(
        &self,
        topic: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let ids = self
            .kv_list_prefix(NS_SUBSCRIPTIONS_BY_TOPIC_CALLBACK, &[topic])
            .await?;
        let mut subs = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(raw) = self.kv_get(NS_SUBSCRIPTIONS, &id).await? {
                let sub: Subscription = serde_json::from_str(&raw)?;
                if sub.verified {
                    subs.push(sub);
                }
            }
        }
        Ok(subs)
    }

    /// Every subscription row (admin projection and sweeps).
    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = self.kv_list(NS_SUBSCRIPTIONS).await?;
        rows.into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(StoreError::from))
            .collect()
    }

    /// Write (create or replace) a subscription and its index entry.
    pub async fn put_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.put_subscription(sub).await?;
            txn.commit().await
        })
        .await
    }

    /// Delete a subscription row together with its index entry.
    pub async fn delete_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.delete_subscription(sub).await?;
            txn.commit().await
        })
        .await
    }

    /// Delete inbound subscriptions whose lease lapsed more than `grace`
    /// ago, plus unverified rows whose verification window expired.
    /// Returns the number of rows removed.
    pub async fn sweep_expired_subscriptions(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<usize, StoreError> {
        let mut removed = 0usize;
        for sub in self.list_subscriptions().await? {
            let lease_lapsed = sub.expires + grace < now;
            let verification_lapsed = !sub.verified
                && sub
                    .verification_expires
                    .map(|t| t < now)
                    .unwrap_or(false);
            if lease_lapsed || verification_lapsed {
                self.delete_subscription(&sub).await?;
                tracing::info!(
                    subscription_id = %sub.id,
                    topic = %sub.topic,
                    verified = sub.verified,
                    "Swept expired subscription"
                );
                removed += 1;
            }
        }
        Ok(removed)
    }
}
