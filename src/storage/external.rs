use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::kv::{
    self, with_commit_retry, Txn, NS_EXTERNAL_SUBSCRIPTIONS,
    NS_EXTERNAL_SUBSCRIPTIONS_BY_CALLBACK, NS_EXTERNAL_SUBSCRIPTIONS_BY_TOPIC,
    NS_USER_CALLBACKS, NS_USER_CALLBACKS_BY_TOPIC_URL,
};
use super::schema::Store;
use super::types::{ExternalSubscription, StoreError, UserCallback};

impl Txn<'_> {
    pub(crate) async fn put_external_subscription(
        &mut self,
        sub: &ExternalSubscription,
    ) -> Result<(), StoreError> {
        let row = serde_json::to_string(sub)?;
        let id = sub.id.to_string();
        self.put(NS_EXTERNAL_SUBSCRIPTIONS, &id, &row).await?;
        self.put(NS_EXTERNAL_SUBSCRIPTIONS_BY_TOPIC, &sub.topic, &id)
            .await?;
        self.put(NS_EXTERNAL_SUBSCRIPTIONS_BY_CALLBACK, &sub.callback_path, &id)
            .await?;
        Ok(())
    }

    pub(crate) async fn delete_external_subscription(
        &mut self,
        sub: &ExternalSubscription,
    ) -> Result<(), StoreError> {
        self.delete(NS_EXTERNAL_SUBSCRIPTIONS, &sub.id.to_string())
            .await?;
        self.delete(NS_EXTERNAL_SUBSCRIPTIONS_BY_TOPIC, &sub.topic)
            .await?;
        self.delete(NS_EXTERNAL_SUBSCRIPTIONS_BY_CALLBACK, &sub.callback_path)
            .await?;
        Ok(())
    }

    pub(crate) async fn put_user_callback(&mut self, cb: &UserCallback) -> Result<(), StoreError> {
        let row = serde_json::to_string(cb)?;
        let id = cb.id.to_string();
        self.put(NS_USER_CALLBACKS, &id, &row).await?;
        self.put(
            NS_USER_CALLBACKS_BY_TOPIC_URL,
            &kv::encode_key(&[&cb.topic, &cb.callback_url]),
            &id,
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn delete_user_callback(&mut self, cb: &UserCallback) -> Result<(), StoreError> {
        self.delete(NS_USER_CALLBACKS, &cb.id.to_string()).await?;
        self.delete(
            NS_USER_CALLBACKS_BY_TOPIC_URL,
            &kv::encode_key(&[&cb.topic, &cb.callback_url]),
        )
        .await?;
        Ok(())
    }
}

impl Store {
    // ========================================================================
    // External Subscription Operations
    // ========================================================================

    pub async fn external_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<ExternalSubscription>, StoreError> {
        match self.kv_get(NS_EXTERNAL_SUBSCRIPTIONS, &id.to_string()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn external_subscription_by_topic(
        &self,
        topic: &str,
    ) -> Result<Option<ExternalSubscription>, StoreError> {
        let id = match self.kv_get(NS_EXTERNAL_SUBSCRIPTIONS_BY_TOPIC, topic).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.kv_get(NS_EXTERNAL_SUBSCRIPTIONS, &id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn external_subscription_by_callback_path(
        &self,
        callback_path: &str,
    ) -> Result<Option<ExternalSubscription>, StoreError> {
        let id = match self
            .kv_get(NS_EXTERNAL_SUBSCRIPTIONS_BY_CALLBACK, callback_path)
            .await?
        {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.kv_get(NS_EXTERNAL_SUBSCRIPTIONS, &id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn list_external_subscriptions(
        &self,
    ) -> Result<Vec<ExternalSubscription>, StoreError> {
        let rows = self.kv_list(NS_EXTERNAL_SUBSCRIPTIONS).await?;
        rows.into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(StoreError::from))
            .collect()
    }

    pub async fn put_external_subscription(
        &self,
        sub: &ExternalSubscription,
    ) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.put_external_subscription(sub).await?;
            txn.commit().await
        })
        .await
    }

    pub async fn delete_external_subscription(
        &self,
        sub: &ExternalSubscription,
    ) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.delete_external_subscription(sub).await?;
            txn.commit().await
        })
        .await
    }

    // ========================================================================
    // User Callback Operations
    // ========================================================================

    pub async fn user_callback(&self, id: Uuid) -> Result<Option<UserCallback>, StoreError> {
        match self.kv_get(NS_USER_CALLBACKS, &id.to_string()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn user_callback_by_topic_url(
        &self,
        topic: &str,
        callback_url: &str,
    ) -> Result<Option<UserCallback>, StoreError> {
        let key = kv::encode_key(&[topic, callback_url]);
        let id = match self.kv_get(NS_USER_CALLBACKS_BY_TOPIC_URL, &key).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.kv_get(NS_USER_CALLBACKS, &id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Verified callbacks registered for one topic (the relay set).
    pub async fn verified_user_callbacks_for_topic(
        &self,
        topic: &str,
    ) -> Result<Vec<UserCallback>, StoreError> {
        let ids = self
            .kv_list_prefix(NS_USER_CALLBACKS_BY_TOPIC_URL, &[topic])
            .await?;
        let mut callbacks = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(raw) = self.kv_get(NS_USER_CALLBACKS, &id).await? {
                let cb: UserCallback = serde_json::from_str(&raw)?;
                if cb.verified {
                    callbacks.push(cb);
                }
            }
        }
        Ok(callbacks)
    }

    /// Token lookup for the manual verification endpoint. Tokens are
    /// random and unique; a full scan is fine at the admin scale this
    /// serves.
    pub async fn user_callback_by_token(
        &self,
        token: &str,
    ) -> Result<Option<UserCallback>, StoreError> {
        for (_, raw) in self.kv_list(NS_USER_CALLBACKS).await? {
            let cb: UserCallback = serde_json::from_str(&raw)?;
            if cb.verification_token.as_deref() == Some(token) {
                return Ok(Some(cb));
            }
        }
        Ok(None)
    }

    pub async fn put_user_callback(&self, cb: &UserCallback) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.put_user_callback(cb).await?;
            txn.commit().await
        })
        .await
    }

    pub async fn delete_user_callback(&self, cb: &UserCallback) -> Result<(), StoreError> {
        with_commit_retry(|| async move {
            let mut txn = self.begin().await?;
            txn.delete_user_callback(cb).await?;
            txn.commit().await
        })
        .await
    }

    /// Purge unverified user callbacks whose verification window closed.
    pub async fn sweep_unverified_user_callbacks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut removed = 0usize;
        for (_, raw) in self.kv_list(NS_USER_CALLBACKS).await? {
            let cb: UserCallback = serde_json::from_str(&raw)?;
            let lapsed = !cb.verified
                && cb
                    .verification_expires
                    .map(|t| t < now)
                    .unwrap_or(false);
            if lapsed {
                self.delete_user_callback(&cb).await?;
                tracing::info!(
                    user_callback_id = %cb.id,
                    topic = %cb.topic,
                    "Purged unverified user callback"
                );
                removed += 1;
            }
        }
        Ok(removed)
    }
}
