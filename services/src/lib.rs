//! Process plumbing shared by the `relay` and `stats-ingest` binaries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::Context;
use outbox_relay_runtime::metrics::MetricsServer;
use outbox_relay_runtime::ServiceConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directives` applies.
pub fn init_tracing(default_directives: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the Prometheus listener on `config.metrics_addr`.
///
/// The returned server must be kept alive for the life of the process.
///
/// # Errors
///
/// Returns error if the exporter cannot be built.
pub fn start_metrics(config: &ServiceConfig) -> anyhow::Result<MetricsServer> {
    let mut server = MetricsServer::new(config.metrics_addr);
    server.start().context("Failed to start metrics server")?;
    Ok(server)
}

/// Connect to `config.database_url`.
///
/// # Errors
///
/// Returns error if no connection can be established.
pub async fn connect(config: &ServiceConfig, max_connections: u32) -> anyhow::Result<PgPool> {
    tracing::info!(max_connections, "Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    tracing::info!("PostgreSQL connected");
    Ok(pool)
}

/// Resolve once the process receives Ctrl-C.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
    }
}
