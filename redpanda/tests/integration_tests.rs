//! Integration tests for the Redpanda producer and consumer with a real Kafka instance.
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p outbox-relay-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use chrono::Utc;
use outbox_relay_core::broker::{BrokerConsumer, BrokerProducer, BrokerRecord};
use outbox_relay_core::checkpoint::Checkpoint;
use outbox_relay_core::event::{TopicEvent, ViewEvent};
use outbox_relay_core::outbox::OutboxId;
use outbox_relay_redpanda::{RedpandaConsumer, RedpandaProducer};
use outbox_relay_runtime::{BackoffPolicy, TopicWorker, WorkerConfig};
use outbox_relay_testing::InMemorySink;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio::sync::watch;

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn view_record(id: i64) -> BrokerRecord {
    let event = ViewEvent {
        post_id: id,
        viewer_id: 2,
        author_id: 3,
        viewed_at: Utc::now(),
    };
    BrokerRecord {
        topic: "view".to_string(),
        key: "view".to_string(),
        event_id: OutboxId(id),
        created_at: Utc::now(),
        payload: event.encode().unwrap(),
    }
}

/// Publish until the topic is auto-created and the broker acknowledges.
async fn publish_when_ready(producer: &RedpandaProducer, records: &[BrokerRecord]) {
    for attempt in 1..=60 {
        if producer.publish_batch(records).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Kafka failed to accept the batch");
    }
}

fn consumer(brokers: &str, group: &str) -> RedpandaConsumer {
    RedpandaConsumer::builder()
        .brokers(brokers)
        .topic("view")
        .group(group)
        .build()
        .expect("Failed to create consumer")
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        batch_capacity: 10,
        buffer_capacity: 100,
        flush_interval: Duration::from_millis(500),
        backoff: BackoffPolicy::fixed(Duration::from_millis(200)),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn published_batch_is_consumed_with_outbox_headers() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = RedpandaProducer::new(&brokers).expect("Failed to create producer");
    let records: Vec<BrokerRecord> = (1..=3).map(view_record).collect();
    publish_when_ready(&producer, &records).await;

    let consumer = consumer(&brokers, "stats-ingest-view");
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while received.len() < 3 {
            if let Some(Ok(record)) = consumer.fetch().await {
                received.push(record);
            }
        }
    })
    .await
    .expect("Timeout waiting for messages");

    let ids: Vec<OutboxId> = received.iter().map(|r| r.event_id).collect();
    assert_eq!(ids, vec![OutboxId(1), OutboxId(2), OutboxId(3)]);
    assert_eq!(ViewEvent::decode(&received[2].payload).unwrap().post_id, 3);
    assert_eq!(received[0].created_at, records[0].created_at);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn committed_checkpoint_is_where_the_group_resumes() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = RedpandaProducer::new(&brokers).expect("Failed to create producer");
    let records: Vec<BrokerRecord> = (1..=4).map(view_record).collect();
    publish_when_ready(&producer, &records).await;

    {
        let first = consumer(&brokers, "resume-group");
        let mut handles = Vec::new();
        tokio::time::timeout(Duration::from_secs(30), async {
            while handles.len() < 2 {
                if let Some(Ok(record)) = first.fetch().await {
                    handles.push(record.handle);
                }
            }
        })
        .await
        .expect("Timeout waiting for messages");
        first
            .commit(&Checkpoint::covering(&handles))
            .await
            .expect("commit");
    }

    let second = consumer(&brokers, "resume-group");
    let next = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(Ok(record)) = second.fetch().await {
                return record;
            }
        }
    })
    .await
    .expect("Timeout waiting for messages");
    assert_eq!(next.event_id, OutboxId(3));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn topic_worker_drains_a_real_topic() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = RedpandaProducer::new(&brokers).expect("Failed to create producer");
    let records: Vec<BrokerRecord> = (1..=25).map(view_record).collect();
    publish_when_ready(&producer, &records).await;

    let sink = InMemorySink::<ViewEvent>::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut worker = TopicWorker::new(
        Arc::new(consumer(&brokers, "stats-ingest-view")),
        Arc::new(sink.clone()),
        worker_config(),
    )
    .spawn(shutdown_rx);

    tokio::time::timeout(Duration::from_secs(30), async {
        while sink.len() < 25 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Timeout waiting for the sink");

    shutdown.send(true).unwrap();
    let summary = worker.wait().await.unwrap();
    assert_eq!(summary.events, 25);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn drained_worker_is_not_redelivered_after_restart() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = RedpandaProducer::new(&brokers).expect("Failed to create producer");
    let records: Vec<BrokerRecord> = (1..=13).map(view_record).collect();
    publish_when_ready(&producer, &records).await;

    let sink = InMemorySink::<ViewEvent>::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut worker = TopicWorker::new(
        Arc::new(consumer(&brokers, "restart-group")),
        Arc::new(sink.clone()),
        worker_config(),
    )
    .spawn(shutdown_rx);

    tokio::time::timeout(Duration::from_secs(30), async {
        while sink.len() < 13 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Timeout waiting for the sink");

    // Stop right away: the final commit must be acknowledged before the
    // worker reports closed.
    shutdown.send(true).unwrap();
    worker.wait().await.unwrap();
    drop(worker);

    let restarted = consumer(&brokers, "restart-group");
    let redelivered = tokio::time::timeout(Duration::from_secs(10), restarted.fetch()).await;
    assert!(redelivered.is_err(), "committed messages were redelivered: {redelivered:?}");

    // New messages still arrive, starting after the checkpoint.
    publish_when_ready(&producer, &[view_record(14)]).await;
    let next = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(Ok(record)) = restarted.fetch().await {
                return record;
            }
        }
    })
    .await
    .expect("Timeout waiting for the new message");
    assert_eq!(next.event_id, OutboxId(14));
}
