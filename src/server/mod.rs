//! The HTTP adapter.
//!
//! Thin axum layer over the core services: parse the request, invoke
//! one operation, format the response. All ordering/filter semantics of
//! the admin views live here, not in the core.

mod admin;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::external::ExternalClient;
use crate::hub::HubService;
use crate::poller::Poller;
use crate::queue::{Dispatcher, Queue};
use crate::storage::Store;

/// Shared application state: the core services behind `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<HubService>,
    pub external: Arc<ExternalClient>,
    pub poller: Arc<Poller>,
    pub store: Store,
    pub queue: Queue,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the core services over one store, queue, and HTTP client.
    pub fn assemble(
        store: Store,
        queue: Queue,
        http: reqwest::Client,
        config: Arc<Config>,
    ) -> Self {
        let hub = Arc::new(HubService::new(
            store.clone(),
            queue.clone(),
            http.clone(),
            config.clone(),
        ));
        let external = Arc::new(ExternalClient::new(
            store.clone(),
            queue.clone(),
            hub.clone(),
            http.clone(),
            config.clone(),
        ));
        let poller = Arc::new(Poller::new(
            store.clone(),
            queue.clone(),
            hub.clone(),
            http,
            config.clone(),
        ));
        Self {
            hub,
            external,
            poller,
            store,
            queue,
            config,
        }
    }

    /// The queue dispatcher over these same services.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            hub: self.hub.clone(),
            external: self.external.clone(),
            poller: self.poller.clone(),
        }
    }
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(handlers::hub_endpoint))
        .route("/health", get(handlers::health))
        .route("/api/subscribe", post(handlers::api_subscribe))
        .route("/api/unsubscribe", post(handlers::api_unsubscribe))
        .route("/api/webhook", post(handlers::api_webhook))
        .route("/api/webhook/verify/{token}", get(handlers::verify_webhook))
        .route(
            "/callback/{id}",
            get(handlers::callback_verification).post(handlers::callback_content),
        )
        .route("/api/feeds", get(admin::list_feeds))
        .route("/api/feeds/{id}", get(admin::get_feed))
        .route("/api/feeds/{id}/items", get(admin::feed_items))
        .route("/api/feeds/{id}/toggle", post(admin::toggle_feed))
        .route("/api/feeds/{id}/poll", post(admin::poll_feed))
        .route("/api/subscriptions", get(admin::list_subscriptions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until shutdown flips, then drain gracefully.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
