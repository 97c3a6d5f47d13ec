use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use q3trackerd::api::routes::{self, AppState};
use q3trackerd::config::Config;
use q3trackerd::master::MasterServer;
use q3trackerd::poller::PollQueue;
use q3trackerd::registry::Registry;
use q3trackerd::{discovery, janitor, poller};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("q3trackerd=info")),
        )
        .init();

    tracing::info!("Starting q3trackerd");

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    let registry = Arc::new(Registry::new());
    let queue = Arc::new(PollQueue::new(config.poll.queue_capacity));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();

    // Upstream discovery
    handles.push(tokio::spawn(discovery::run(
        registry.clone(),
        queue.clone(),
        config.upstream.clone(),
        cancel.clone(),
    )));

    // Poll workers and the periodic scan
    for _ in 0..config.poll.workers.max(1) {
        handles.push(tokio::spawn(poller::run_worker(
            registry.clone(),
            queue.clone(),
            cancel.clone(),
        )));
    }
    handles.push(tokio::spawn(poller::run_scan(
        registry.clone(),
        queue.clone(),
        Duration::from_secs(config.poll.interval_secs),
        cancel.clone(),
    )));

    // Master UDP listener
    let master = MasterServer::bind(&config.master.listen, registry.clone(), queue.clone()).await?;
    handles.push(tokio::spawn(master.run(cancel.clone())));

    // Janitor
    handles.push(tokio::spawn(janitor::run(
        registry.clone(),
        Duration::from_secs(config.janitor.interval_secs),
        cancel.clone(),
    )));

    // HTTP API
    let app = routes::router(AppState {
        registry: registry.clone(),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http.port))
        .await
        .with_context(|| format!("Failed to bind HTTP listener on port {}", config.http.port))?;
    tracing::info!(port = config.http.port, "API listening");

    let server_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("HTTP server error: {err}");
        }
    }));

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
