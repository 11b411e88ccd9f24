//! Courier gateway - HTTP ingress for the email dispatch service.
//!
//! Accepts authenticated send requests and hands them to the delivery
//! engine's enqueuer; exposes stats, health, and Prometheus metrics.

use courier_config::tracing::{init_tracing, install_color_eyre};
use domain_delivery::{metrics, DeliveryConfig, Enqueuer, StatsService};
use queue_store::RedisQueueStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

mod api;
mod config;
mod identity;
mod state;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_color_eyre();

    let config = Config::from_env()?;
    init_tracing(&config.environment);
    metrics::init_metrics();

    let app_info = courier_config::app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting courier gateway");
    info!("Environment: {:?}", config.environment);

    // Connect to the queue store with startup retry
    let redis = queue_store::connect_with_retry(&config.redis.url, None)
        .await
        .map_err(|e| eyre::eyre!("Queue store connection failed: {}", e))?;
    let store = Arc::new(RedisQueueStore::new(redis));

    let identity = Arc::new(identity::ServiceDirectory::from_env()?);
    info!(services = identity.len(), "Service token directory loaded");

    let delivery_config = DeliveryConfig::from_env();
    let state = AppState {
        enqueuer: Arc::new(Enqueuer::new(store.clone(), delivery_config.clone())),
        stats: Arc::new(StatsService::new(store, delivery_config)),
        identity,
    };

    let app = api::routes(state);

    let address = config.listen.socket_addr();
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| eyre::eyre!("Failed to bind {}: {}", address, e))?;

    info!(address = %address, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| eyre::eyre!("Server error: {}", e))?;

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
