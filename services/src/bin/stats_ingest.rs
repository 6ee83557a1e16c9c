//! Stats ingestion: one topic worker per catalog topic, writing to the
//! Postgres stats table until Ctrl-C.

use anyhow::Context;
use outbox_relay_core::broker::BrokerConsumer;
use outbox_relay_core::event::{CommentEvent, LikeEvent, RegistrationEvent, Topic, ViewEvent};
use outbox_relay_postgres::PostgresQuarantine;
use outbox_relay_redpanda::RedpandaConsumer;
use outbox_relay_runtime::{Orchestrator, ServiceConfig, WorkerConfig};
use outbox_relay_services::{connect, init_tracing, shutdown_signal, start_metrics};
use outbox_relay_stats::PostgresStatsSink;
use std::sync::Arc;
use tracing::{info, warn};

fn consumer(service: &ServiceConfig, topic: Topic) -> anyhow::Result<Arc<dyn BrokerConsumer>> {
    let group = service.consumer_group(topic.as_str());
    let consumer = RedpandaConsumer::builder()
        .brokers(&service.kafka_brokers)
        .topic(topic.as_str())
        .group(&group)
        .build()
        .with_context(|| format!("Failed to create consumer for topic '{topic}'"))?;
    info!(topic = %topic, group = %group, "Consumer subscribed");
    Ok(Arc::new(consumer))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,outbox_relay_runtime=info");

    let service = ServiceConfig::from_env("stats-ingest").context("Invalid service configuration")?;
    let worker_config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    info!(
        service = %service.service_name,
        brokers = %service.kafka_brokers,
        batch_capacity = worker_config.batch_capacity,
        buffer_capacity = worker_config.buffer_capacity,
        "Configuration loaded"
    );

    let _metrics = start_metrics(&service)?;

    // One connection per topic worker plus one for quarantine writes.
    let pool = connect(&service, 6).await?;
    outbox_relay_postgres::migrate(&pool)
        .await
        .context("Failed to run quarantine migrations")?;
    outbox_relay_stats::migrate(&pool)
        .await
        .context("Failed to run stats migrations")?;

    let stats = Arc::new(PostgresStatsSink::new(pool.clone()));
    let quarantine = Arc::new(PostgresQuarantine::new(pool));

    let mut orchestrator =
        Orchestrator::new(worker_config, service.shutdown_timeout).with_dead_letters(quarantine);
    orchestrator
        .register::<RegistrationEvent, _>(consumer(&service, Topic::Registration)?, Arc::clone(&stats))?
        .register::<ViewEvent, _>(consumer(&service, Topic::View)?, Arc::clone(&stats))?
        .register::<LikeEvent, _>(consumer(&service, Topic::Like)?, Arc::clone(&stats))?
        .register::<CommentEvent, _>(consumer(&service, Topic::Comment)?, Arc::clone(&stats))?;
    orchestrator.start()?;

    shutdown_signal().await;
    let report = orchestrator.shutdown().await;
    for (topic, summary) in &report.drained {
        info!(topic = %topic, events = summary.events, "Worker drained");
    }
    if !report.is_clean() {
        warn!(
            aborted = ?report.aborted,
            failed = ?report.failed,
            "Some workers did not drain; their uncommitted messages will be redelivered"
        );
    }
    Ok(())
}
