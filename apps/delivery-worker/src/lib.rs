//! Delivery Worker Service
//!
//! The worker process of the email dispatch service: a supervised pool of
//! consumers on the priority streams, the parked-job scheduler, and a
//! small health/admin HTTP server.
//!
//! ## Architecture
//!
//! ```text
//! queue:ready:{high,medium,low}  (consumer group: email-workers)
//!   ↓
//! WorkerSupervisor → N × Worker ──► RateLimiter ──► ProviderDriver
//!   │                    │ transient failure
//!   │                    ▼
//!   │               RetryController ──► queue:parked ──► Scheduler
//!   │                    │ spent attempts
//!   │                    ▼
//!   │                queue:dlq
//!   └── reclaim + heartbeat loops
//! ```

use courier_config::listen::ListenConfig;
use courier_config::redis::RedisConfig;
use courier_config::{Environment, FromEnv};
use domain_delivery::providers::{
    MailgunDriver, SendGridDriver, SesDriver, SmtpConfig, SmtpDriver,
};
use domain_delivery::{
    metrics, DeliveryConfig, DriverRegistry, ProviderKind, Scheduler, StatsService,
    TemplateEngine, WorkerContext, WorkerSupervisor,
};
use eyre::WrapErr;
use queue_store::{QueueStore, RedisQueueStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod health;

/// Run the delivery worker process.
///
/// 1. Env-aware logging and Prometheus metrics
/// 2. Queue store connection with startup retry
/// 3. Driver registry from provider credentials in the environment
/// 4. Supervisor (workers + reclaim + heartbeat), scheduler, health server
/// 5. Graceful drain on SIGINT/SIGTERM
pub async fn run() -> eyre::Result<()> {
    courier_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    courier_config::tracing::init_tracing(&environment);
    metrics::init_metrics();

    let app_info = courier_config::app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting delivery worker service");
    info!("Environment: {:?}", environment);

    let health_listen =
        ListenConfig::health_from_env().wrap_err("Failed to load health listener config")?;

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load queue store config")?;
    let redis = queue_store::connect_with_retry(&redis_config.url, None)
        .await
        .wrap_err("Failed to connect to queue store")?;
    let store: Arc<dyn QueueStore> = Arc::new(RedisQueueStore::new(redis));

    let config = DeliveryConfig::from_env();
    info!(
        worker_count = config.worker_count,
        max_attempts = config.max_attempts,
        default_provider = %config.default_provider,
        "Engine configuration loaded"
    );

    let drivers = build_driver_registry(&environment).await?;
    let templates = TemplateEngine::new()
        .map_err(|e| eyre::eyre!("Failed to initialize template engine: {}", e))?;

    let ctx = WorkerContext::new(store.clone(), config.clone(), drivers, templates);

    // Shutdown plumbing
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Health/admin server
    let stats = Arc::new(StatsService::new(store.clone(), config.clone()));
    let health_state = health::HealthState {
        stats,
        app_name: app_info.name.to_string(),
        app_version: app_info.version.to_string(),
    };
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_state, health_listen.socket_addr()).await {
            error!(error = %e, "Health server failed");
        }
    });

    // Scheduler (leader-elected across processes)
    let supervisor = WorkerSupervisor::new(ctx);
    let scheduler = Scheduler::new(store, config, format!("{}-sched", supervisor.process_id()));
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.run(scheduler_rx).await {
            error!(error = %e, "Scheduler exited with error");
        }
    });

    // Worker pool runs until drained
    supervisor
        .run(shutdown_rx)
        .await
        .map_err(|e| eyre::eyre!("Worker supervisor failed: {}", e))?;

    let _ = scheduler_handle.await;
    info!("Delivery worker service stopped");
    Ok(())
}

/// Register every provider with credentials in the environment. SMTP is
/// always present (it defaults to a local Mailpit in development); the
/// HTTP providers and SES join when configured.
async fn build_driver_registry(environment: &Environment) -> eyre::Result<DriverRegistry> {
    let smtp_config = SmtpConfig::from_env();
    let smtp = SmtpDriver::new(&smtp_config)
        .map_err(|e| eyre::eyre!("SMTP driver configuration error: {}", e))?;

    let mut registry = DriverRegistry::new().register(ProviderKind::Smtp, Arc::new(smtp));
    info!(host = %smtp_config.host, port = smtp_config.port, "Registered SMTP driver");

    match SendGridDriver::from_env() {
        Ok(driver) => {
            registry = registry.register(ProviderKind::Sendgrid, Arc::new(driver));
            info!("Registered SendGrid driver");
        }
        Err(reason) if environment.expects_provider_credentials() => {
            warn!(reason = %reason, "SendGrid driver not configured");
        }
        Err(_) => {}
    }

    match MailgunDriver::from_env() {
        Ok(driver) => {
            registry = registry.register(ProviderKind::Mailgun, Arc::new(driver));
            info!("Registered Mailgun driver");
        }
        Err(reason) if environment.expects_provider_credentials() => {
            warn!(reason = %reason, "Mailgun driver not configured");
        }
        Err(_) => {}
    }

    match SesDriver::from_env().await {
        Ok(driver) => {
            registry = registry.register(ProviderKind::AwsSes, Arc::new(driver));
            info!("Registered AWS SES driver");
        }
        Err(reason) if environment.expects_provider_credentials() => {
            warn!(reason = %reason, "AWS SES driver not configured");
        }
        Err(_) => {}
    }

    Ok(registry)
}

async fn serve_health(state: health::HealthState, addr: std::net::SocketAddr) -> eyre::Result<()> {
    let app = health::router(state);

    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health and admin server listening");

    axum::serve(listener, app).await.wrap_err("Health server failed")?;
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
