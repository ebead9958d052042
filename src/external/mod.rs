//! The external-subscription client.
//!
//! The outward face of the service: given a feed or page URL it
//! discovers the feed's hub, subscribes there on the user's behalf, and
//! relays whatever the hub pushes to the user's own callback URL. When
//! no hub exists it falls back to the polling engine, wiring the polled
//! content through this hub's own fan-out so the relay path stays
//! identical either way.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::feed::{Discovery, DiscoveryError};
use crate::hub::HubService;
use crate::queue::{EnqueueOptions, HandlerError, Queue, QueueMessage, VerifyMode};
use crate::storage::{ExternalSubscription, Store, StoreError, Subscription, UserCallback};
use crate::util::{random_token, validate_absolute_url};

/// User-callback verification tokens are honored for 24 hours.
const USER_CALLBACK_TOKEN_HOURS: i64 = 24;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("Invalid topic URL: {0}")]
    InvalidTopic(String),

    #[error("Invalid callback URL: {0}")]
    InvalidCallback(String),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("No hub or feed found at the target URL")]
    NothingDiscovered,

    #[error("Upstream hub rejected the subscription: {0}")]
    SubscribeRejected(String),

    #[error("Unknown callback path")]
    UnknownCallback,

    #[error("Topic does not match this callback")]
    TopicMismatch,

    #[error("Callback is not verified")]
    NotVerified,

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

impl ExternalError {
    /// True for malformed-input failures (HTTP 400 class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ExternalError::InvalidTopic(_) | ExternalError::InvalidCallback(_)
        )
    }
}

/// Result of a `subscribe_to_feed` call, shaped for the webhook API.
#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub external_subscription_id: Uuid,
    pub using_fallback: bool,
    /// True while the user callback still awaits its verification
    /// round-trip.
    pub pending_verification: bool,
    pub message: String,
}

// ============================================================================
// Service
// ============================================================================

/// The external client service.
pub struct ExternalClient {
    store: Store,
    queue: Queue,
    discovery: Discovery,
    hub: Arc<HubService>,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl ExternalClient {
    pub fn new(
        store: Store,
        queue: Queue,
        hub: Arc<HubService>,
        http: reqwest::Client,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            queue,
            discovery: Discovery::new(http.clone()),
            hub,
            http,
            config,
        }
    }

    fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.config.webhook_timeout_ms)
    }

    /// Relay retries: one initial attempt plus `webhook_retries`.
    fn relay_backoff(&self) -> Vec<Duration> {
        [
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ]
        .into_iter()
        .take(self.config.webhook_retries as usize)
        .collect()
    }

    // ========================================================================
    // Subscribe
    // ========================================================================

    /// Subscribe to a feed on the user's behalf.
    ///
    /// Registers (or re-verifies) the user callback, then ensures an
    /// ExternalSubscription for the topic exists: via the discovered
    /// hub when there is one, via polling fallback otherwise.
    pub async fn subscribe_to_feed(
        &self,
        topic: &str,
        user_callback_url: Option<&str>,
    ) -> Result<WebhookOutcome, ExternalError> {
        validate_absolute_url(topic).map_err(|e| ExternalError::InvalidTopic(e.to_string()))?;

        let mut pending_verification = false;
        if let Some(callback_url) = user_callback_url {
            validate_absolute_url(callback_url)
                .map_err(|e| ExternalError::InvalidCallback(e.to_string()))?;
            pending_verification = !self.register_user_callback(topic, callback_url).await?;
        }

        if let Some(existing) = self.store.external_subscription_by_topic(topic).await? {
            return Ok(WebhookOutcome {
                external_subscription_id: existing.id,
                using_fallback: existing.using_fallback,
                pending_verification,
                message: "Already subscribed to this topic".to_string(),
            });
        }

        let discovered = self.discovery.discover(topic).await?;

        let outcome = match discovered.hub_url {
            Some(hub_url) => {
                let sub = self
                    .subscribe_to_external_hub(topic, &hub_url, user_callback_url)
                    .await?;
                WebhookOutcome {
                    external_subscription_id: sub.id,
                    using_fallback: false,
                    pending_verification,
                    message: format!("Subscribed via hub {hub_url}"),
                }
            }
            None => {
                let feed_url = discovered
                    .feed_url
                    .ok_or(ExternalError::NothingDiscovered)?;
                let sub = self
                    .subscribe_to_own_hub(topic, &feed_url, user_callback_url)
                    .await?;
                WebhookOutcome {
                    external_subscription_id: sub.id,
                    using_fallback: true,
                    pending_verification,
                    message: format!("No hub found; polling {feed_url}"),
                }
            }
        };

        Ok(outcome)
    }

    /// Subscribe at an upstream WebSub hub. The hub will verify us by
    /// GETting our callback path; until then the row stays unverified.
    async fn subscribe_to_external_hub(
        &self,
        topic: &str,
        hub_url: &str,
        user_callback_url: Option<&str>,
    ) -> Result<ExternalSubscription, ExternalError> {
        let now = Utc::now();
        let lease_seconds = self.config.default_lease_seconds;
        let sub = ExternalSubscription {
            id: Uuid::new_v4(),
            topic: topic.to_owned(),
            hub: Some(hub_url.to_owned()),
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: random_token(32),
            lease_seconds,
            created: now,
            expires: now + chrono::Duration::seconds(i64::from(lease_seconds)),
            verified: false,
            last_renewed: None,
            using_fallback: false,
            user_callback_url: user_callback_url.map(str::to_owned),
            error_count: 0,
            last_error: None,
        };
        self.store.put_external_subscription(&sub).await?;

        match self.post_subscribe_form(&sub, hub_url).await {
            Ok(()) => {
                tracing::info!(
                    topic = %topic,
                    hub = %hub_url,
                    callback_path = %sub.callback_path,
                    "Subscribe request sent to upstream hub"
                );
                Ok(sub)
            }
            Err(reason) => {
                let mut marked = sub.clone();
                marked.error_count = 1;
                marked.last_error = Some(reason.clone());
                self.store.put_external_subscription(&marked).await?;
                Err(ExternalError::SubscribeRejected(reason))
            }
        }
    }

    /// Polling fallback: polling is the verification, so the row is
    /// born verified. The polled content re-enters this hub's own
    /// fan-out through a self-subscription against the feed URL, which
    /// is what lands on our callback path and triggers the relay.
    async fn subscribe_to_own_hub(
        &self,
        topic: &str,
        feed_url: &str,
        user_callback_url: Option<&str>,
    ) -> Result<ExternalSubscription, ExternalError> {
        let now = Utc::now();
        let lease_seconds = self.config.default_lease_seconds;
        let sub = ExternalSubscription {
            id: Uuid::new_v4(),
            topic: topic.to_owned(),
            hub: None,
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: random_token(32),
            lease_seconds,
            created: now,
            expires: now + chrono::Duration::seconds(i64::from(lease_seconds)),
            verified: true,
            last_renewed: None,
            using_fallback: true,
            user_callback_url: user_callback_url.map(str::to_owned),
            error_count: 0,
            last_error: None,
        };
        self.store.put_external_subscription(&sub).await?;

        self.hub.ensure_feed(feed_url).await.map_err(|err| match err {
            HandlerError::Retry(reason) | HandlerError::Fatal(reason) => {
                ExternalError::SubscribeRejected(reason)
            }
        })?;

        // Self-subscription: fan-out for the polled feed delivers to our
        // callback path like any other subscriber would receive it.
        let own_callback = format!("{}{}", self.config.base_url, sub.callback_path);
        let inbound = Subscription {
            id: Uuid::new_v4(),
            topic: feed_url.to_owned(),
            callback: own_callback,
            secret: None,
            lease_seconds,
            created: now,
            expires: now + chrono::Duration::seconds(i64::from(lease_seconds)),
            verified: true,
            verification_token: None,
            verification_expires: None,
            error_count: 0,
            last_error: None,
            last_error_time: None,
        };
        self.store.put_subscription(&inbound).await?;

        tracing::info!(
            topic = %topic,
            feed_url = %feed_url,
            "Subscribed via polling fallback"
        );
        Ok(sub)
    }

    async fn post_subscribe_form(
        &self,
        sub: &ExternalSubscription,
        hub_url: &str,
    ) -> Result<(), String> {
        let callback = format!("{}{}", self.config.base_url, sub.callback_path);
        let form = [
            ("hub.mode", "subscribe".to_string()),
            ("hub.topic", sub.topic.clone()),
            ("hub.callback", callback),
            ("hub.lease_seconds", sub.lease_seconds.to_string()),
            ("hub.secret", sub.secret.clone()),
        ];

        let outcome = tokio::time::timeout(
            self.webhook_timeout(),
            self.http.post(hub_url).form(&form).send(),
        )
        .await;

        match outcome {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("hub returned status {}", response.status().as_u16())),
            Ok(Err(err)) => Err(format!("hub request failed: {err}")),
            Err(_) => Err("hub request timed out".to_string()),
        }
    }

    // ========================================================================
    // User callbacks
    // ========================================================================

    /// Get or create the UserCallback for `(topic, url)` and run its
    /// verification round-trip if still unverified. Returns true when
    /// the callback ends up verified.
    async fn register_user_callback(
        &self,
        topic: &str,
        callback_url: &str,
    ) -> Result<bool, ExternalError> {
        let existing = self
            .store
            .user_callback_by_topic_url(topic, callback_url)
            .await?;

        let callback = match existing {
            Some(cb) if cb.verified => return Ok(true),
            Some(mut cb) => {
                // Re-send with a fresh token and window.
                cb.verification_token = Some(random_token(32));
                cb.verification_expires =
                    Some(Utc::now() + chrono::Duration::hours(USER_CALLBACK_TOKEN_HOURS));
                self.store.put_user_callback(&cb).await?;
                cb
            }
            None => {
                let cb = UserCallback {
                    id: Uuid::new_v4(),
                    topic: topic.to_owned(),
                    callback_url: callback_url.to_owned(),
                    verified: false,
                    verification_token: Some(random_token(32)),
                    verification_expires: Some(
                        Utc::now() + chrono::Duration::hours(USER_CALLBACK_TOKEN_HOURS),
                    ),
                    last_used: None,
                    error_count: 0,
                    last_error: None,
                };
                self.store.put_user_callback(&cb).await?;
                cb
            }
        };

        self.send_user_callback_verification(&callback).await
    }

    /// The ownership check before any forwarding: GET the callback with
    /// `?mode=verify&token=X` and expect the token echoed back. A
    /// mismatch leaves the row pending; the owner can still confirm via
    /// the verification endpoint before the token expires.
    async fn send_user_callback_verification(
        &self,
        callback: &UserCallback,
    ) -> Result<bool, ExternalError> {
        let token = match &callback.verification_token {
            Some(token) => token.clone(),
            None => return Ok(callback.verified),
        };

        let outcome = tokio::time::timeout(
            self.webhook_timeout(),
            self.http
                .get(&callback.callback_url)
                .query(&[("mode", "verify"), ("token", &token)])
                .send(),
        )
        .await;

        let echoed = match outcome {
            Ok(Ok(response)) if response.status().is_success() => {
                response.text().await.unwrap_or_default().trim() == token
            }
            _ => false,
        };

        if echoed {
            let mut verified = callback.clone();
            verified.verified = true;
            verified.verification_token = None;
            verified.verification_expires = None;
            self.store.put_user_callback(&verified).await?;
            tracing::info!(
                user_callback_id = %callback.id,
                callback_url = %callback.callback_url,
                "User callback verified"
            );
        } else {
            tracing::debug!(
                user_callback_id = %callback.id,
                callback_url = %callback.callback_url,
                "User callback verification pending"
            );
        }
        Ok(echoed)
    }

    /// Manual confirmation via `GET /api/webhook/verify/:token`.
    pub async fn confirm_user_callback(&self, token: &str) -> Result<bool, ExternalError> {
        let callback = match self.store.user_callback_by_token(token).await? {
            Some(cb) => cb,
            None => return Ok(false),
        };

        if let Some(expires) = callback.verification_expires {
            if expires < Utc::now() {
                return Ok(false);
            }
        }

        let mut verified = callback;
        verified.verified = true;
        verified.verification_token = None;
        verified.verification_expires = None;
        self.store.put_user_callback(&verified).await?;
        Ok(true)
    }

    // ========================================================================
    // Upstream callback endpoint
    // ========================================================================

    /// Upstream hub verification GET against `/callback/:id`. Returns
    /// the challenge to echo.
    pub async fn handle_callback_verification(
        &self,
        callback_id: Uuid,
        mode: VerifyMode,
        topic: &str,
        challenge: String,
        lease_seconds: Option<u32>,
    ) -> Result<String, ExternalError> {
        let path = format!("/callback/{callback_id}");
        let sub = self
            .store
            .external_subscription_by_callback_path(&path)
            .await?
            .ok_or(ExternalError::UnknownCallback)?;

        if sub.topic != topic {
            return Err(ExternalError::TopicMismatch);
        }

        match mode {
            VerifyMode::Subscribe => {
                let mut verified = sub.clone();
                verified.verified = true;
                let lease = lease_seconds.unwrap_or(sub.lease_seconds);
                verified.lease_seconds = lease;
                verified.expires = Utc::now() + chrono::Duration::seconds(i64::from(lease));
                self.store.put_external_subscription(&verified).await?;
                tracing::info!(topic = %topic, callback_path = %path, "External subscription verified");
            }
            VerifyMode::Unsubscribe => {
                self.store.delete_external_subscription(&sub).await?;
                tracing::info!(topic = %topic, callback_path = %path, "External subscription removed");
            }
        }

        Ok(challenge)
    }

    /// Upstream content POST against `/callback/:id`: queue a relay to
    /// every verified user callback on this topic. Returns the relay
    /// count.
    pub async fn handle_callback_content(
        &self,
        callback_id: Uuid,
        content_type: &str,
        body: &[u8],
    ) -> Result<usize, ExternalError> {
        let path = format!("/callback/{callback_id}");
        let sub = self
            .store
            .external_subscription_by_callback_path(&path)
            .await?
            .ok_or(ExternalError::UnknownCallback)?;

        if !sub.verified {
            return Err(ExternalError::NotVerified);
        }

        let callbacks = self
            .store
            .verified_user_callbacks_for_topic(&sub.topic)
            .await?;
        for callback in &callbacks {
            let message = QueueMessage::RelayToUserCallback {
                user_callback_id: callback.id,
                content_type: content_type.to_owned(),
                body: body.to_vec(),
            };
            self.queue
                .enqueue(
                    &message,
                    EnqueueOptions {
                        backoff: Some(self.relay_backoff()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        tracing::info!(
            topic = %sub.topic,
            callback_path = %path,
            relays = callbacks.len(),
            "Queued user-callback relays"
        );
        Ok(callbacks.len())
    }

    // ========================================================================
    // Relay handler
    // ========================================================================

    /// Queue handler for `RelayToUserCallback`.
    pub async fn handle_relay(
        &self,
        user_callback_id: Uuid,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), HandlerError> {
        let callback = match self.store.user_callback(user_callback_id).await? {
            // Purged since enqueue: drop.
            Some(cb) => cb,
            None => return Ok(()),
        };

        let outcome = tokio::time::timeout(
            self.webhook_timeout(),
            self.http
                .post(&callback.callback_url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .header("X-SuperDuperFeeder-Topic", &callback.topic)
                .body(body.to_vec())
                .send(),
        )
        .await;

        match outcome {
            Ok(Ok(response)) if response.status().is_success() => {
                let mut used = callback.clone();
                used.last_used = Some(Utc::now());
                used.error_count = 0;
                used.last_error = None;
                self.store.put_user_callback(&used).await?;
                Ok(())
            }
            Ok(Ok(response)) => {
                let reason = format!("callback returned status {}", response.status().as_u16());
                self.mark_relay_failure(&callback, &reason).await?;
                Err(HandlerError::Retry(reason))
            }
            Ok(Err(err)) => {
                let reason = format!("relay POST failed: {err}");
                self.mark_relay_failure(&callback, &reason).await?;
                Err(HandlerError::Retry(reason))
            }
            Err(_) => {
                let reason = "relay POST timed out".to_string();
                self.mark_relay_failure(&callback, &reason).await?;
                Err(HandlerError::Retry(reason))
            }
        }
    }

    async fn mark_relay_failure(
        &self,
        callback: &UserCallback,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut marked = callback.clone();
        marked.error_count = callback.error_count.saturating_add(1);
        marked.last_error = Some(reason.to_owned());
        self.store.put_user_callback(&marked).await?;
        tracing::warn!(
            user_callback_id = %callback.id,
            callback_url = %callback.callback_url,
            reason,
            "User-callback relay failed"
        );
        Ok(())
    }

    // ========================================================================
    // Renewal
    // ========================================================================

    /// Scheduler tick: find verified subscriptions expiring inside the
    /// renewal window. Fallback rows renew in place; external rows get a
    /// `Renew` message. Returns the number of candidates handled.
    pub async fn renew_due(&self) -> Result<usize, ExternalError> {
        let window = chrono::Duration::minutes(i64::from(self.config.renewal_window_minutes));
        let deadline = Utc::now() + window;
        let mut renewed = 0usize;

        for sub in self.store.list_external_subscriptions().await? {
            if !sub.verified || sub.expires > deadline {
                continue;
            }
            if sub.using_fallback {
                self.advance_fallback_lease(sub).await?;
            } else {
                self.queue
                    .enqueue(
                        &QueueMessage::Renew {
                            external_subscription_id: sub.id,
                        },
                        EnqueueOptions::deduped(format!("renew:{}", sub.id)),
                    )
                    .await?;
            }
            renewed += 1;
        }
        Ok(renewed)
    }

    async fn advance_fallback_lease(
        &self,
        sub: ExternalSubscription,
    ) -> Result<(), ExternalError> {
        let now = Utc::now();
        let mut advanced = sub;
        advanced.expires = now + chrono::Duration::seconds(i64::from(advanced.lease_seconds));
        advanced.last_renewed = Some(now);
        self.store.put_external_subscription(&advanced).await?;
        tracing::debug!(
            external_subscription_id = %advanced.id,
            expires = %advanced.expires,
            "Advanced fallback lease"
        );
        Ok(())
    }

    /// Queue handler for `Renew`: re-issue the subscribe POST with the
    /// same secret.
    pub async fn handle_renew(&self, id: Uuid) -> Result<(), HandlerError> {
        let sub = match self.store.external_subscription(id).await? {
            Some(sub) => sub,
            None => return Ok(()),
        };

        if sub.using_fallback {
            // A fallback row that reached the queue anyway renews in
            // place; repeat delivery is harmless.
            self.advance_fallback_lease(sub)
                .await
                .map_err(|e| HandlerError::retry(e))?;
            return Ok(());
        }

        let hub_url = match &sub.hub {
            Some(hub_url) => hub_url.clone(),
            None => return Ok(()),
        };

        match self.post_subscribe_form(&sub, &hub_url).await {
            Ok(()) => {
                let mut renewed = sub.clone();
                renewed.last_renewed = Some(Utc::now());
                renewed.error_count = 0;
                renewed.last_error = None;
                self.store.put_external_subscription(&renewed).await?;
                tracing::info!(
                    external_subscription_id = %sub.id,
                    topic = %sub.topic,
                    "Renewal request sent"
                );
                Ok(())
            }
            Err(reason) => {
                let mut marked = sub.clone();
                marked.error_count = sub.error_count.saturating_add(1);
                marked.last_error = Some(reason.clone());
                self.store.put_external_subscription(&marked).await?;
                Err(HandlerError::Retry(reason))
            }
        }
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Purge unverified user callbacks with lapsed tokens.
    pub async fn sweep_user_callbacks(&self) -> Result<usize, ExternalError> {
        Ok(self.store.sweep_unverified_user_callbacks(Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Echoes the `token` query parameter, as a cooperating user
    /// callback would.
    struct EchoToken;

    impl Respond for EchoToken {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let token = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            ResponseTemplate::new(200).set_body_string(token)
        }
    }

    async fn client() -> ExternalClient {
        let store = Store::open(":memory:").await.unwrap();
        let queue = Queue::new(store.pool().clone(), Duration::from_secs(300));
        let config = Arc::new(Config::default());
        let http = reqwest::Client::new();
        let hub = Arc::new(HubService::new(
            store.clone(),
            queue.clone(),
            http.clone(),
            config.clone(),
        ));
        ExternalClient::new(store, queue, hub, http, config)
    }

    #[tokio::test]
    async fn test_register_user_callback_verifies_on_echo() {
        let external = client().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cb"))
            .and(query_param("mode", "verify"))
            .respond_with(EchoToken)
            .mount(&server)
            .await;

        let url = format!("{}/cb", server.uri());
        let verified = external
            .register_user_callback("https://ex.com/feed", &url)
            .await
            .unwrap();
        assert!(verified);

        let cb = external
            .store
            .user_callback_by_topic_url("https://ex.com/feed", &url)
            .await
            .unwrap()
            .unwrap();
        assert!(cb.verified);
        assert!(cb.verification_token.is_none());
    }

    #[tokio::test]
    async fn test_register_user_callback_pending_on_mismatch() {
        let external = client().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("zzz"))
            .mount(&server)
            .await;

        let url = format!("{}/cb", server.uri());
        let verified = external
            .register_user_callback("https://ex.com/feed", &url)
            .await
            .unwrap();
        assert!(!verified);

        let cb = external
            .store
            .user_callback_by_topic_url("https://ex.com/feed", &url)
            .await
            .unwrap()
            .unwrap();
        assert!(!cb.verified);
        assert!(cb.verification_token.is_some());
    }

    #[tokio::test]
    async fn test_confirm_user_callback_by_token() {
        let external = client().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = format!("{}/cb", server.uri());
        external
            .register_user_callback("https://ex.com/feed", &url)
            .await
            .unwrap();

        let cb = external
            .store
            .user_callback_by_topic_url("https://ex.com/feed", &url)
            .await
            .unwrap()
            .unwrap();
        let token = cb.verification_token.clone().unwrap();

        assert!(external.confirm_user_callback(&token).await.unwrap());
        assert!(!external.confirm_user_callback("bogus").await.unwrap());

        let cb = external.store.user_callback(cb.id).await.unwrap().unwrap();
        assert!(cb.verified);
    }

    #[tokio::test]
    async fn test_callback_verification_echoes_challenge() {
        let external = client().await;
        let sub = ExternalSubscription {
            id: Uuid::new_v4(),
            topic: "https://ex.com/feed".to_string(),
            hub: Some("https://hub.ex/".to_string()),
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: "s".to_string(),
            lease_seconds: 3600,
            created: Utc::now(),
            expires: Utc::now(),
            verified: false,
            last_renewed: None,
            using_fallback: false,
            user_callback_url: None,
            error_count: 0,
            last_error: None,
        };
        external.store.put_external_subscription(&sub).await.unwrap();

        let callback_id: Uuid = sub.callback_path["/callback/".len()..].parse().unwrap();
        let echoed = external
            .handle_callback_verification(
                callback_id,
                VerifyMode::Subscribe,
                "https://ex.com/feed",
                "challenge-xyz".to_string(),
                Some(7200),
            )
            .await
            .unwrap();
        assert_eq!(echoed, "challenge-xyz");

        let stored = external
            .store
            .external_subscription(sub.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.verified);
        assert_eq!(stored.lease_seconds, 7200);
    }

    #[tokio::test]
    async fn test_callback_verification_rejects_topic_mismatch() {
        let external = client().await;
        let sub = ExternalSubscription {
            id: Uuid::new_v4(),
            topic: "https://ex.com/feed".to_string(),
            hub: Some("https://hub.ex/".to_string()),
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: "s".to_string(),
            lease_seconds: 3600,
            created: Utc::now(),
            expires: Utc::now(),
            verified: false,
            last_renewed: None,
            using_fallback: false,
            user_callback_url: None,
            error_count: 0,
            last_error: None,
        };
        external.store.put_external_subscription(&sub).await.unwrap();

        let callback_id: Uuid = sub.callback_path["/callback/".len()..].parse().unwrap();
        let err = external
            .handle_callback_verification(
                callback_id,
                VerifyMode::Subscribe,
                "https://evil.ex/other",
                "c".to_string(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalError::TopicMismatch));
    }

    #[tokio::test]
    async fn test_content_on_unverified_callback_rejected() {
        let external = client().await;
        let sub = ExternalSubscription {
            id: Uuid::new_v4(),
            topic: "https://ex.com/feed".to_string(),
            hub: Some("https://hub.ex/".to_string()),
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: "s".to_string(),
            lease_seconds: 3600,
            created: Utc::now(),
            expires: Utc::now(),
            verified: false,
            last_renewed: None,
            using_fallback: false,
            user_callback_url: None,
            error_count: 0,
            last_error: None,
        };
        external.store.put_external_subscription(&sub).await.unwrap();

        let callback_id: Uuid = sub.callback_path["/callback/".len()..].parse().unwrap();
        let err = external
            .handle_callback_content(callback_id, "application/rss+xml", b"<rss/>")
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalError::NotVerified));
    }

    #[tokio::test]
    async fn test_renew_due_splits_fallback_and_external() {
        let external = client().await;
        let now = Utc::now();

        let mut fallback = ExternalSubscription {
            id: Uuid::new_v4(),
            topic: "https://ex.com/a".to_string(),
            hub: None,
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: "s".to_string(),
            lease_seconds: 3600,
            created: now,
            expires: now + chrono::Duration::minutes(10),
            verified: true,
            last_renewed: None,
            using_fallback: true,
            user_callback_url: None,
            error_count: 0,
            last_error: None,
        };
        let mut upstream = fallback.clone();
        upstream.id = Uuid::new_v4();
        upstream.topic = "https://ex.com/b".to_string();
        upstream.callback_path = format!("/callback/{}", Uuid::new_v4());
        upstream.hub = Some("https://hub.ex/".to_string());
        upstream.using_fallback = false;

        let mut distant = fallback.clone();
        distant.id = Uuid::new_v4();
        distant.topic = "https://ex.com/c".to_string();
        distant.callback_path = format!("/callback/{}", Uuid::new_v4());
        distant.expires = now + chrono::Duration::days(20);

        external.store.put_external_subscription(&fallback).await.unwrap();
        external.store.put_external_subscription(&upstream).await.unwrap();
        external.store.put_external_subscription(&distant).await.unwrap();

        let handled = external.renew_due().await.unwrap();
        assert_eq!(handled, 2);

        // The fallback lease advanced in place.
        fallback = external
            .store
            .external_subscription(fallback.id)
            .await
            .unwrap()
            .unwrap();
        assert!(fallback.expires > now + chrono::Duration::minutes(30));
        assert!(fallback.last_renewed.is_some());

        // The upstream renewal went through the queue.
        assert_eq!(external.queue.depth().await.unwrap(), 1);

        // The distant row was untouched.
        upstream = external
            .store
            .external_subscription(distant.id)
            .await
            .unwrap()
            .unwrap();
        assert!(upstream.last_renewed.is_none());
    }
}
