//! Periodic triggers.
//!
//! Three interval loops: the polling tick enqueues due feeds, the
//! maintenance tick renews outbound leases and sweeps stale
//! verification tokens, and the expiration tick clears inbound
//! subscriptions past their lease plus grace. The real work always runs
//! off the queue or the store; the loops only trigger it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::external::ExternalClient;
use crate::poller::Poller;
use crate::storage::Store;

pub struct Scheduler {
    pub store: Store,
    pub poller: Arc<Poller>,
    pub external: Arc<ExternalClient>,
    pub config: Arc<Config>,
}

impl Scheduler {
    /// Spawn the three periodic loops. Each exits when shutdown is
    /// signalled.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let poll_tick = Duration::from_secs(self.config.poll_tick_seconds);
        let maintenance_tick = Duration::from_secs(self.config.maintenance_tick_seconds);
        let sweep_tick = Duration::from_secs(self.config.sweep_tick_seconds);

        let poller = self.poller.clone();
        let poll_task = spawn_tick("poll", poll_tick, shutdown.clone(), move || {
            let poller = poller.clone();
            async move {
                match poller.enqueue_due().await {
                    Ok(queued) if queued > 0 => {
                        tracing::info!(queued, "Polling tick enqueued due feeds");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "Polling tick failed"),
                }
            }
        });

        let external = self.external.clone();
        let maintenance_task = spawn_tick(
            "maintenance",
            maintenance_tick,
            shutdown.clone(),
            move || {
                let external = external.clone();
                async move {
                    match external.renew_due().await {
                        Ok(renewed) if renewed > 0 => {
                            tracing::info!(renewed, "Renewal candidates handled");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %err, "Renewal tick failed"),
                    }
                    match external.sweep_user_callbacks().await {
                        Ok(purged) if purged > 0 => {
                            tracing::info!(purged, "Purged stale user callbacks");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %err, "User-callback sweep failed"),
                    }
                }
            },
        );

        let store = self.store.clone();
        let grace = chrono::Duration::seconds(self.config.expired_grace_seconds as i64);
        let sweep_task = spawn_tick("sweep", sweep_tick, shutdown, move || {
            let store = store.clone();
            async move {
                match store.sweep_expired_subscriptions(Utc::now(), grace).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Cleared expired subscriptions");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "Expiration sweep failed"),
                }
            }
        });

        vec![poll_task, maintenance_task, sweep_task]
    }
}

fn spawn_tick<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of tokio's interval fires immediately; skip it
        // so startup does not front-run recovery.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(task = name, "Scheduler task stopped");
    })
}
