//! flowhook HTTP service.

mod logging;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Json, Router};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::info;
use utoipa::OpenApi;

use flowhook_webhooks::services::{spawn_alert_sweeper, spawn_store_probe};
use flowhook_webhooks::{
    webhooks_router, ApiDoc, BackgroundTasks, EventStore, FileTier, InMemoryEventStore,
    PgEventStore, ReliabilityConfig, ReliabilityState, WebhooksState,
};

/// How often silent alerts are swept.
const ALERT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = ReliabilityConfig::from_env().context("Configuration error")?;
    logging::init_logging(&config.log_filter)?;

    // The signing secret is the one configuration value the service cannot run without.
    if let Err(e) = config.require_webhook_secret() {
        tracing::error!(error = %e, "Refusing to start");
        return Err(e).context("Configuration error");
    }

    info!(config = ?config, "Starting flowhook");

    let store: Arc<dyn EventStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(config.dependency_timeout())
                .connect(url)
                .await
                .context("Database connection error")?;
            let store = PgEventStore::new(pool);
            store.migrate().await.context("Event store migration failed")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; events are kept in memory only");
            Arc::new(InMemoryEventStore::new())
        }
    };

    let mut builder = ReliabilityState::builder(config.clone()).store(store);
    let mut file_tier = None;
    if let Some(dir) = &config.fallback_cache_dir {
        let tier = Arc::new(
            FileTier::open(dir)
                .with_context(|| format!("Cannot open fallback cache dir {}", dir.display()))?,
        );
        builder = builder.cache_tier(tier.clone());
        file_tier = Some(tier);
    }
    let reliability = Arc::new(builder.build().context("Failed to build pipeline state")?);

    let mut tasks = BackgroundTasks::new();
    tasks.push(spawn_store_probe(
        reliability.store.clone(),
        reliability.clock.clone(),
        Duration::from_secs(config.store_probe_interval_secs.max(1)),
    ));
    tasks.push(spawn_alert_sweeper(
        reliability.alerts.clone(),
        reliability.clock.clone(),
        ALERT_SWEEP_INTERVAL,
    ));

    let app = Router::new()
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(reliability.clone())
        .merge(webhooks_router(WebhooksState::new(reliability)));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tasks.shutdown();
    if let Some(tier) = file_tier {
        tokio::task::spawn_blocking(move || tier.flush())
            .await
            .context("Fallback cache flush failed")?;
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
