pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod models;
pub mod period;
pub mod resolver;
pub mod service;

use crate::api::{create_router, ApiState};
use crate::config::AppConfig;
use crate::service::DashboardCore;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Loads configuration, opens the store and serves the dashboard API until
/// the process is stopped.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.log_dir).map_err(anyhow::Error::msg)?;

    let bind_address = config.bind_address.clone();
    let core = Arc::new(DashboardCore::new(config)?);
    tracing::info!(
        database = %core.database().path().display(),
        backend = ?core.config().resolver_backend,
        "kpi dashboard starting"
    );

    let router = create_router(ApiState { core });
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("kpi dashboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "kpi-dashboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
