//! Outbox relay: drains the Postgres outbox into Redpanda until Ctrl-C.

use anyhow::Context;
use outbox_relay_postgres::{PostgresOutbox, migrate};
use outbox_relay_redpanda::RedpandaProducer;
use outbox_relay_runtime::{RelayConfig, RelayJob, ServiceConfig};
use outbox_relay_services::{connect, init_tracing, shutdown_signal, start_metrics};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,outbox_relay_runtime=info");

    let service = ServiceConfig::from_env("relay").context("Invalid service configuration")?;
    let relay_config = RelayConfig::from_env().context("Invalid relay configuration")?;
    info!(
        service = %service.service_name,
        brokers = %service.kafka_brokers,
        interval_ms = u64::try_from(relay_config.interval.as_millis()).unwrap_or(u64::MAX),
        batch_size = relay_config.batch_size,
        full_rescan_every = relay_config.full_rescan_every,
        "Configuration loaded"
    );

    let _metrics = start_metrics(&service)?;

    let pool = connect(&service, 5).await?;
    migrate(&pool).await.context("Failed to run outbox migrations")?;
    let outbox = PostgresOutbox::new(pool);
    info!(
        backlog = outbox.unprocessed_count().await.unwrap_or(-1),
        "Outbox ready"
    );

    let producer = RedpandaProducer::builder()
        .brokers(&service.kafka_brokers)
        .build()
        .context("Failed to create Redpanda producer")?;

    let relay = RelayJob::new(outbox, Arc::new(producer), relay_config).spawn();

    shutdown_signal().await;
    relay.stop().await;
    info!("Relay shut down");
    Ok(())
}
