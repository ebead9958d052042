use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use superduperfeeder::config::Config;
use superduperfeeder::queue::{Queue, Worker};
use superduperfeeder::scheduler::Scheduler;
use superduperfeeder::server::{self, AppState};
use superduperfeeder::storage::Store;
use superduperfeeder::util::build_http_client;

/// Grace period for in-flight queue handlers on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config_path = std::env::var("SUPERDUPERFEEDER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("superduperfeeder.toml"));
    let config = Arc::new(Config::load(&config_path).context("Failed to load configuration")?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        base_url = %config.base_url,
        "Starting superduperfeeder"
    );

    let store = Store::open(&config.database_path)
        .await
        .context("Failed to open store")?;
    let queue = Queue::new(
        store.pool().clone(),
        Duration::from_secs(config.queue_visibility_secs),
    );
    let http = build_http_client().context("Failed to build HTTP client")?;

    let state = AppState::assemble(store.clone(), queue.clone(), http, config.clone());
    let dispatcher = state.dispatcher();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Queue consumers. Messages claimed before a crash resurface via
    // their visibility timeout, so startup needs no special recovery.
    let mut worker_handles = Vec::with_capacity(config.queue_workers);
    for _ in 0..config.queue_workers {
        let worker = Worker::new(queue.clone(), dispatcher.clone());
        worker_handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }
    info!(workers = config.queue_workers, "Queue workers started");

    let scheduler = Scheduler {
        store: store.clone(),
        poller: state.poller.clone(),
        external: state.external.clone(),
        config: config.clone(),
    };
    let scheduler_handles = scheduler.spawn(shutdown_rx.clone());

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Server listening");

    let server_handle = tokio::spawn(server::serve(state, listener, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        for handle in scheduler_handles {
            let _ = handle.await;
        }
        let _ = server_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Drain grace elapsed, abandoning in-flight work"
        );
    }

    info!("Shutdown complete");
    Ok(())
}
