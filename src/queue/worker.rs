//! The queue dispatch loop.
//!
//! Workers claim messages and route them by tag to the owning service.
//! Handlers are panic-isolated: a panicking handler counts as a failed
//! attempt, so a poison message drains into the dead-letter table once
//! its retry budget is spent instead of wedging the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;

use super::{Claimed, Queue, QueueError, QueueMessage};
use crate::external::ExternalClient;
use crate::hub::HubService;
use crate::poller::Poller;

// ============================================================================
// Handler errors
// ============================================================================

/// How a handler failure should be treated by the queue.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Soft failure: requeue per the message's backoff schedule.
    #[error("{0}")]
    Retry(String),

    /// Deterministic failure: bury immediately, retrying cannot help.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retry(err: impl std::fmt::Display) -> Self {
        HandlerError::Retry(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        HandlerError::Fatal(err.to_string())
    }
}

// Storage pressure requeues with backoff; the queue itself becomes the
// backpressure signal when the store is down.
impl From<crate::storage::StoreError> for HandlerError {
    fn from(err: crate::storage::StoreError) -> Self {
        HandlerError::Retry(err.to_string())
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        HandlerError::Retry(err.to_string())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes claimed messages to the service that owns them.
#[derive(Clone)]
pub struct Dispatcher {
    pub hub: Arc<HubService>,
    pub external: Arc<ExternalClient>,
    pub poller: Arc<Poller>,
}

impl Dispatcher {
    pub async fn dispatch(&self, claimed: &Claimed) -> Result<(), HandlerError> {
        match &claimed.message {
            QueueMessage::PollFeed { feed_id } => self.poller.handle_poll(*feed_id).await,
            QueueMessage::Distribute {
                subscription_id,
                topic,
                content_type,
                body,
            } => {
                self.hub
                    .handle_distribute(*subscription_id, topic, content_type, body)
                    .await
            }
            QueueMessage::Verify {
                subscription_id,
                mode,
                topic,
                challenge,
                token,
                lease_seconds,
            } => {
                self.hub
                    .handle_verify(
                        *subscription_id,
                        *mode,
                        topic,
                        challenge,
                        token,
                        *lease_seconds,
                    )
                    .await
            }
            QueueMessage::Renew {
                external_subscription_id,
            } => self.external.handle_renew(*external_subscription_id).await,
            QueueMessage::RelayToUserCallback {
                user_callback_id,
                content_type,
                body,
            } => {
                self.external
                    .handle_relay(*user_callback_id, content_type, body)
                    .await
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// One consumer of the queue. Several workers may run concurrently; the
/// guarded claim in [`Queue::claim`] keeps them from double-processing.
pub struct Worker {
    queue: Queue,
    dispatcher: Dispatcher,
    idle_poll: Duration,
}

impl Worker {
    pub fn new(queue: Queue, dispatcher: Dispatcher) -> Self {
        Self {
            queue,
            dispatcher,
            idle_poll: Duration::from_millis(250),
        }
    }

    /// Run until shutdown is signalled. In-flight messages finish before
    /// the loop exits (the caller bounds the drain with a grace timeout).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim().await {
                Ok(Some(claimed)) => self.process(claimed).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "Queue claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::debug!("Queue worker stopped");
    }

    /// Process every currently-available message and return the count.
    /// Startup recovery and the test suites drive the queue through
    /// this; delayed retries stay untouched until they come due.
    pub async fn run_pending(&self) -> Result<usize, QueueError> {
        let mut processed = 0usize;
        while let Some(claimed) = self.queue.claim().await? {
            self.process(claimed).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, claimed: Claimed) {
        let kind = claimed.message.kind();
        let outcome = AssertUnwindSafe(self.dispatcher.dispatch(&claimed))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(
                    message = kind,
                    attempt = claimed.attempt,
                    panic = %detail,
                    "Queue handler panicked"
                );
                Err(HandlerError::Retry(format!("panic: {detail}")))
            }
        };

        let queue_result = match result {
            Ok(()) => self.queue.ack(&claimed).await,
            Err(HandlerError::Retry(reason)) => self.queue.fail(&claimed, &reason).await,
            Err(HandlerError::Fatal(reason)) => self.queue.bury(&claimed, &reason).await,
        };

        if let Err(err) = queue_result {
            // The visibility timeout re-surfaces the message later.
            tracing::error!(message = kind, error = %err, "Failed to settle queue message");
        }
    }
}
