//! The hub protocol engine.
//!
//! Owns the inbound subscription lifecycle: accepting subscribe and
//! unsubscribe requests, driving the out-of-band verification round-trip
//! against subscriber callbacks, ingesting publish notifications, and
//! fanning content out through the queue. The HTTP adapter calls the
//! `process_*` operations; the queue worker calls the `handle_*`
//! message handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::queue::{EnqueueOptions, HandlerError, Queue, QueueMessage, VerifyMode};
use crate::storage::{with_commit_retry, Feed, Store, StoreError, Subscription};
use crate::util::{hub_signature, random_challenge, random_token, validate_absolute_url};

/// Secrets ride in a form field; WebSub bounds them.
const MAX_SECRET_BYTES: usize = 200;

/// Verification tokens are honored for 15 minutes.
const VERIFICATION_WINDOW_MINUTES: i64 = 15;

// ============================================================================
// Errors
// ============================================================================

/// Hub operation failures. The 400-class variants surface verbatim to
/// callers; upstream failures carry the status that caused them.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid topic URL: {0}")]
    InvalidTopic(String),

    #[error("Invalid callback URL: {0}")]
    InvalidCallback(String),

    #[error("hub.lease_seconds out of range: {0}")]
    LeaseOutOfRange(u32),

    #[error("hub.secret too long: {0} bytes (max {MAX_SECRET_BYTES})")]
    SecretTooLong(usize),

    #[error("Topic fetch returned status {0}")]
    PublishFetchStatus(u16),

    #[error("Topic fetch failed: {0}")]
    PublishFetch(#[from] reqwest::Error),

    #[error("Topic fetch timed out")]
    PublishFetchTimeout,

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

impl HubError {
    /// True for malformed-input failures (HTTP 400 class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HubError::InvalidTopic(_)
                | HubError::InvalidCallback(_)
                | HubError::LeaseOutOfRange(_)
                | HubError::SecretTooLong(_)
        )
    }
}

// ============================================================================
// Requests and results
// ============================================================================

/// A parsed subscribe/unsubscribe request.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub mode: VerifyMode,
    pub topic: String,
    pub callback: String,
    pub lease_seconds: Option<u32>,
    pub secret: Option<String>,
}

/// Acknowledgement returned once the verification message is durably
/// queued.
#[derive(Debug, Clone)]
pub struct SubscriptionAccepted {
    pub subscription_id: Uuid,
}

// ============================================================================
// Service
// ============================================================================

/// The hub engine. Cheap to clone behind `Arc`; all state lives in the
/// store and queue.
pub struct HubService {
    store: Store,
    queue: Queue,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl HubService {
    pub fn new(store: Store, queue: Queue, http: reqwest::Client, config: Arc<Config>) -> Self {
        Self {
            store,
            queue,
            http,
            config,
        }
    }

    fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.config.webhook_timeout_ms)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Accept a subscribe or unsubscribe request.
    ///
    /// Validates the input, writes (or refreshes) the subscription row in
    /// pending state, and enqueues the verification GET — row and message
    /// in one transaction, so a 202 means the verification cannot be
    /// lost.
    ///
    /// # Errors
    ///
    /// 400-class [`HubError`] variants on malformed input; storage/queue
    /// errors otherwise.
    pub async fn process_subscription_request(
        &self,
        request: SubscriptionRequest,
    ) -> Result<SubscriptionAccepted, HubError> {
        validate_absolute_url(&request.topic)
            .map_err(|e| HubError::InvalidTopic(e.to_string()))?;
        validate_absolute_url(&request.callback)
            .map_err(|e| HubError::InvalidCallback(e.to_string()))?;

        if let Some(lease) = request.lease_seconds {
            if lease == 0 || lease > self.config.max_lease_seconds {
                return Err(HubError::LeaseOutOfRange(lease));
            }
        }
        if let Some(secret) = &request.secret {
            if secret.len() > MAX_SECRET_BYTES {
                return Err(HubError::SecretTooLong(secret.len()));
            }
        }

        let lease_seconds = request
            .lease_seconds
            .unwrap_or(self.config.default_lease_seconds);
        let now = Utc::now();
        let challenge = random_challenge();
        let token = random_token(32);
        let token_expires = now + chrono::Duration::minutes(VERIFICATION_WINDOW_MINUTES);

        let existing = self
            .store
            .subscription_by_topic_callback(&request.topic, &request.callback)
            .await?;

        let subscription = match existing {
            Some(mut sub) => {
                // Either direction returns the row to pending; a row
                // carrying a verification token is never verified.
                sub.verified = false;
                if request.mode == VerifyMode::Subscribe {
                    sub.lease_seconds = lease_seconds;
                    sub.expires = now + chrono::Duration::seconds(i64::from(lease_seconds));
                    if request.secret.is_some() {
                        sub.secret = request.secret.clone();
                    }
                }
                sub.verification_token = Some(token.clone());
                sub.verification_expires = Some(token_expires);
                sub
            }
            None => Subscription {
                id: Uuid::new_v4(),
                topic: request.topic.clone(),
                callback: request.callback.clone(),
                secret: request.secret.clone(),
                lease_seconds,
                created: now,
                expires: now + chrono::Duration::seconds(i64::from(lease_seconds)),
                verified: false,
                verification_token: Some(token.clone()),
                verification_expires: Some(token_expires),
                error_count: 0,
                last_error: None,
                last_error_time: None,
            },
        };

        let message = QueueMessage::Verify {
            subscription_id: subscription.id,
            mode: request.mode,
            topic: request.topic.clone(),
            challenge,
            token,
            lease_seconds: match request.mode {
                VerifyMode::Subscribe => Some(lease_seconds),
                VerifyMode::Unsubscribe => None,
            },
        };

        let prepared = self.queue.prepare(&message, EnqueueOptions::default())?;
        let (subscription_ref, prepared_ref) = (&subscription, &prepared);
        with_commit_retry(|| async move {
            let mut txn = self.store.begin().await?;
            txn.put_subscription(subscription_ref).await?;
            prepared_ref.stage(&mut txn).await?;
            txn.commit().await
        })
        .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            mode = request.mode.as_str(),
            topic = %request.topic,
            callback = %request.callback,
            "Accepted subscription request"
        );

        Ok(SubscriptionAccepted {
            subscription_id: subscription.id,
        })
    }

    /// Handle `hub.mode=publish`: fetch the topic and fan out its
    /// current content. Returns the number of subscribers notified.
    ///
    /// # Errors
    ///
    /// Fails when the topic URL is malformed or the fetch does not
    /// return 2xx.
    pub async fn process_publish_request(&self, topic: &str) -> Result<usize, HubError> {
        validate_absolute_url(topic).map_err(|e| HubError::InvalidTopic(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.feed_fetch_timeout_secs);
        let response = tokio::time::timeout(timeout, self.http.get(topic).send())
            .await
            .map_err(|_| HubError::PublishFetchTimeout)?
            .map_err(HubError::PublishFetch)?;

        if !response.status().is_success() {
            return Err(HubError::PublishFetchStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/rss+xml")
            .to_owned();
        let body = response.bytes().await.map_err(HubError::PublishFetch)?;

        self.process_content_notification(topic, &body, &content_type)
            .await
    }

    /// Fan one content payload out to every verified subscriber of the
    /// topic. The body is relayed verbatim; each subscriber gets its own
    /// queue message so one slow callback cannot delay the rest.
    pub async fn process_content_notification(
        &self,
        topic: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<usize, HubError> {
        let subscribers = self.store.verified_subscriptions_for_topic(topic).await?;

        for sub in &subscribers {
            let message = QueueMessage::Distribute {
                subscription_id: sub.id,
                topic: topic.to_owned(),
                content_type: content_type.to_owned(),
                body: body.to_vec(),
            };
            self.queue.enqueue(&message, EnqueueOptions::default()).await?;
        }

        tracing::info!(
            topic = %topic,
            subscribers = subscribers.len(),
            content_type = %content_type,
            "Queued content distribution"
        );
        Ok(subscribers.len())
    }

    // ========================================================================
    // Verification handler
    // ========================================================================

    /// Execute the verification GET for a pending subscribe/unsubscribe.
    ///
    /// Stale messages (missing row, superseded token, expired window)
    /// drop silently; the row state in the store decides everything.
    pub async fn handle_verify(
        &self,
        subscription_id: Uuid,
        mode: VerifyMode,
        topic: &str,
        challenge: &str,
        token: &str,
        lease_seconds: Option<u32>,
    ) -> Result<(), HandlerError> {
        let sub = match self.store.subscription(subscription_id).await? {
            Some(sub) => sub,
            None => return Ok(()),
        };

        if sub.verification_token.as_deref() != Some(token) {
            tracing::debug!(subscription_id = %subscription_id, "Dropping stale verification");
            return Ok(());
        }

        if let Some(expires) = sub.verification_expires {
            if expires < Utc::now() {
                // Subscribe rows are left for the sweep; an expired
                // unsubscribe just lapses.
                tracing::debug!(subscription_id = %subscription_id, "Verification window expired");
                return Ok(());
            }
        }

        let mut query: Vec<(&str, String)> = vec![
            ("hub.mode", mode.as_str().to_owned()),
            ("hub.topic", topic.to_owned()),
            ("hub.challenge", challenge.to_owned()),
        ];
        if let Some(lease) = lease_seconds {
            query.push(("hub.lease_seconds", lease.to_string()));
        }

        let outcome = tokio::time::timeout(
            self.webhook_timeout(),
            self.http.get(&sub.callback).query(&query).send(),
        )
        .await;

        let confirmed = match outcome {
            Ok(Ok(response)) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                body.trim() == challenge
            }
            Ok(Ok(_)) => false,
            Ok(Err(err)) => {
                // Transport failure: retry per the message's schedule.
                return Err(HandlerError::retry(err));
            }
            Err(_) => return Err(HandlerError::Retry("verification GET timed out".into())),
        };

        match (mode, confirmed) {
            (VerifyMode::Subscribe, true) => {
                let mut verified = sub.clone();
                verified.verified = true;
                verified.verification_token = None;
                verified.verification_expires = None;
                verified.expires =
                    Utc::now() + chrono::Duration::seconds(i64::from(sub.lease_seconds));
                self.store.put_subscription(&verified).await?;
                tracing::info!(
                    subscription_id = %sub.id,
                    topic = %sub.topic,
                    expires = %verified.expires,
                    "Subscription verified"
                );
            }
            (VerifyMode::Unsubscribe, _) => {
                // Challenge mismatch or a dead callback still means the
                // subscriber is gone.
                self.store.delete_subscription(&sub).await?;
                tracing::info!(subscription_id = %sub.id, topic = %sub.topic, "Subscription removed");
            }
            (VerifyMode::Subscribe, false) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    topic = %sub.topic,
                    "Subscribe verification rejected by callback"
                );
                self.try_outbound_polling_fallback(&sub).await?;
            }
        }

        Ok(())
    }

    /// Lenient recovery for *outbound* interest only: if this topic has
    /// an unverified ExternalSubscription and resolves to a parseable
    /// feed, polling stands in for the failed verification. Inbound
    /// subscriptions never take this path; they stay pending until the
    /// sweep collects them.
    async fn try_outbound_polling_fallback(&self, sub: &Subscription) -> Result<(), HandlerError> {
        let external = match self
            .store
            .external_subscription_by_topic(&sub.topic)
            .await?
        {
            Some(ext) if !ext.verified => ext,
            _ => return Ok(()),
        };

        let timeout = Duration::from_secs(self.config.feed_fetch_timeout_secs);
        let fetched = tokio::time::timeout(timeout, self.http.get(&sub.topic).send()).await;
        let parseable = match fetched {
            Ok(Ok(response)) if response.status().is_success() => response
                .bytes()
                .await
                .ok()
                .map(|b| crate::feed::parse_feed(&b).is_ok())
                .unwrap_or(false),
            _ => false,
        };
        if !parseable {
            return Ok(());
        }

        self.ensure_feed(&sub.topic).await?;

        let mut fallback = external;
        fallback.verified = true;
        fallback.using_fallback = true;
        fallback.hub = None;
        self.store.put_external_subscription(&fallback).await?;

        let mut verified = sub.clone();
        verified.verified = true;
        verified.verification_token = None;
        verified.verification_expires = None;
        self.store.put_subscription(&verified).await?;

        tracing::info!(topic = %sub.topic, "Falling back to polling for outbound subscription");
        Ok(())
    }

    /// Create the feed row for a topic if it does not exist yet, and
    /// enqueue its first poll.
    pub async fn ensure_feed(&self, url: &str) -> Result<Feed, HandlerError> {
        if let Some(feed) = self.store.feed_by_url(url).await? {
            return Ok(feed);
        }

        let feed = Feed {
            id: Uuid::new_v4(),
            url: url.to_owned(),
            title: None,
            description: None,
            last_fetched: None,
            last_updated: None,
            etag: None,
            last_modified: None,
            polling_interval_minutes: self
                .config
                .default_polling_interval_minutes
                .max(self.config.min_polling_interval_minutes),
            active: true,
            supports_websub: false,
            websub_hub: None,
            error_count: 0,
            last_error: None,
            last_error_time: None,
            last_processed_entry_id: None,
        };

        match self.store.create_feed(&feed).await {
            Ok(()) => {}
            // Concurrent creation: somebody else won, use theirs.
            Err(StoreError::Conflict(_)) => {
                if let Some(existing) = self.store.feed_by_url(url).await? {
                    return Ok(existing);
                }
            }
            Err(err) => return Err(err.into()),
        }

        self.queue
            .enqueue(
                &QueueMessage::PollFeed { feed_id: feed.id },
                EnqueueOptions::deduped(format!("poll:{}", feed.id)),
            )
            .await?;

        tracing::info!(feed_id = %feed.id, url = %url, "Created feed for polling");
        Ok(feed)
    }

    // ========================================================================
    // Distribution handler
    // ========================================================================

    /// POST one content payload to one subscriber.
    ///
    /// Failures mark the subscription row and requeue per the backoff
    /// schedule; a success clears any previous error mark, so the row
    /// reflects only the subscriber's last response.
    pub async fn handle_distribute(
        &self,
        subscription_id: Uuid,
        topic: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), HandlerError> {
        let sub = match self.store.subscription(subscription_id).await? {
            Some(sub) if sub.verified => sub,
            // Unsubscribed or never verified since enqueue: drop.
            _ => return Ok(()),
        };

        let link = format!(
            "<{}>; rel=\"self\", <{}>; rel=\"hub\"",
            topic,
            self.config.hub_url()
        );

        let mut request = self
            .http
            .post(&sub.callback)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::LINK, link)
            .body(body.to_vec());

        if let Some(secret) = &sub.secret {
            request = request.header("X-Hub-Signature", hub_signature(secret, body));
        }

        let outcome = tokio::time::timeout(self.webhook_timeout(), request.send()).await;

        match outcome {
            Ok(Ok(response)) if response.status().is_success() => {
                if sub.error_count > 0 || sub.last_error.is_some() {
                    let mut cleared = sub.clone();
                    cleared.error_count = 0;
                    cleared.last_error = None;
                    cleared.last_error_time = None;
                    self.store.put_subscription(&cleared).await?;
                }
                tracing::debug!(
                    subscription_id = %sub.id,
                    callback = %sub.callback,
                    bytes = body.len(),
                    "Delivered content"
                );
                Ok(())
            }
            Ok(Ok(response)) => {
                let reason = format!("callback returned status {}", response.status().as_u16());
                self.mark_delivery_failure(&sub, &reason).await?;
                Err(HandlerError::Retry(reason))
            }
            Ok(Err(err)) => {
                let reason = format!("callback POST failed: {err}");
                self.mark_delivery_failure(&sub, &reason).await?;
                Err(HandlerError::Retry(reason))
            }
            Err(_) => {
                let reason = "callback POST timed out".to_owned();
                self.mark_delivery_failure(&sub, &reason).await?;
                Err(HandlerError::Retry(reason))
            }
        }
    }

    async fn mark_delivery_failure(
        &self,
        sub: &Subscription,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut marked = sub.clone();
        marked.error_count = sub.error_count.saturating_add(1);
        marked.last_error = Some(reason.to_owned());
        marked.last_error_time = Some(Utc::now());
        self.store.put_subscription(&marked).await?;
        tracing::warn!(
            subscription_id = %sub.id,
            callback = %sub.callback,
            error_count = marked.error_count,
            reason,
            "Content delivery failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> HubService {
        let store = Store::open(":memory:").await.unwrap();
        let queue = Queue::new(store.pool().clone(), Duration::from_secs(300));
        HubService::new(
            store,
            queue,
            reqwest::Client::new(),
            Arc::new(Config::default()),
        )
    }

    fn subscribe_request(topic: &str, callback: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            mode: VerifyMode::Subscribe,
            topic: topic.to_owned(),
            callback: callback.to_owned(),
            lease_seconds: Some(3600),
            secret: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_rejects_bad_topic() {
        let hub = service().await;
        let err = hub
            .process_subscription_request(subscribe_request("not a url", "https://sub.ex/cb"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidTopic(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_lease_out_of_range() {
        let hub = service().await;
        let mut request = subscribe_request("https://ex.com/a", "https://sub.ex/cb");
        request.lease_seconds = Some(0);
        assert!(matches!(
            hub.process_subscription_request(request.clone()).await,
            Err(HubError::LeaseOutOfRange(0))
        ));

        request.lease_seconds = Some(u32::MAX);
        assert!(matches!(
            hub.process_subscription_request(request).await,
            Err(HubError::LeaseOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_oversized_secret() {
        let hub = service().await;
        let mut request = subscribe_request("https://ex.com/a", "https://sub.ex/cb");
        request.secret = Some("x".repeat(201));
        assert!(matches!(
            hub.process_subscription_request(request).await,
            Err(HubError::SecretTooLong(201))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_creates_pending_row_with_token() {
        let hub = service().await;
        let accepted = hub
            .process_subscription_request(subscribe_request("https://ex.com/a", "https://sub.ex/cb"))
            .await
            .unwrap();

        let sub = hub
            .store
            .subscription(accepted.subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!sub.verified);
        assert!(sub.verification_token.is_some());
        assert!(sub.verification_expires.is_some());
        assert_eq!(sub.lease_seconds, 3600);

        // The verification message was committed with the row.
        assert_eq!(hub.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lease_defaults_when_absent() {
        let hub = service().await;
        let mut request = subscribe_request("https://ex.com/a", "https://sub.ex/cb");
        request.lease_seconds = None;
        let accepted = hub.process_subscription_request(request).await.unwrap();

        let sub = hub
            .store
            .subscription(accepted.subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.lease_seconds, Config::default().default_lease_seconds);
    }

    #[tokio::test]
    async fn test_resubscribe_reuses_row() {
        let hub = service().await;
        let first = hub
            .process_subscription_request(subscribe_request("https://ex.com/a", "https://sub.ex/cb"))
            .await
            .unwrap();
        let second = hub
            .process_subscription_request(subscribe_request("https://ex.com/a", "https://sub.ex/cb"))
            .await
            .unwrap();
        assert_eq!(first.subscription_id, second.subscription_id);
        assert_eq!(hub.store.list_subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_content_notification_counts_verified_only() {
        let hub = service().await;
        let accepted = hub
            .process_subscription_request(subscribe_request("https://ex.com/a", "https://sub.ex/cb"))
            .await
            .unwrap();

        // Still pending: no distribution.
        let count = hub
            .process_content_notification("https://ex.com/a", b"<rss/>", "application/rss+xml")
            .await
            .unwrap();
        assert_eq!(count, 0);

        let mut sub = hub
            .store
            .subscription(accepted.subscription_id)
            .await
            .unwrap()
            .unwrap();
        sub.verified = true;
        hub.store.put_subscription(&sub).await.unwrap();

        let count = hub
            .process_content_notification("https://ex.com/a", b"<rss/>", "application/rss+xml")
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
