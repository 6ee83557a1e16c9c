//! End to end: outbox, relay, broker, topic worker, sink

#![allow(clippy::unwrap_used)] // Tests can unwrap

use chrono::Utc;
use outbox_relay_core::broker::BrokerConsumer;
use outbox_relay_core::event::ViewEvent;
use outbox_relay_core::outbox::OutboxId;
use outbox_relay_runtime::{BackoffPolicy, RelayConfig, RelayJob, TickOutcome, TopicWorker, WorkerConfig};
use outbox_relay_testing::{InMemoryBroker, InMemoryOutbox, InMemorySink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("outbox_relay_runtime=debug")
        .with_test_writer()
        .try_init();
}

fn views(range: std::ops::Range<i64>) -> Vec<ViewEvent> {
    range
        .map(|i| ViewEvent {
            post_id: i % 7,
            viewer_id: i,
            author_id: 42,
            viewed_at: Utc::now(),
        })
        .collect()
}

#[tokio::test]
async fn views_relayed_over_three_ticks_land_in_full_batches() {
    init_tracing();
    let outbox = InMemoryOutbox::new();
    let broker = InMemoryBroker::new();
    let sink = InMemorySink::<ViewEvent>::new();

    let mut relay = RelayJob::new(
        outbox.clone(),
        Arc::new(broker.clone()),
        RelayConfig {
            interval: Duration::from_secs(5),
            batch_size: 100,
            full_rescan_every: 0,
        },
    );
    let mut ids = Vec::new();
    for (burst, expected) in [(0..100, 100), (100..200, 100), (200..237, 37)] {
        ids.extend(outbox.seed(&views(burst)));
        assert_eq!(relay.tick().await, TickOutcome::Relayed { count: expected });
    }
    assert_eq!(relay.tick().await, TickOutcome::Idle);
    broker.close();

    let (_shutdown, shutdown_rx) = watch::channel(false);
    let consumer: Arc<dyn BrokerConsumer> = Arc::new(broker.consumer("view", "stats-ingest-view"));
    let mut worker = TopicWorker::new(
        consumer,
        Arc::new(sink.clone()),
        WorkerConfig {
            batch_capacity: 10,
            buffer_capacity: 1000,
            flush_interval: Duration::from_secs(3600),
            backoff: BackoffPolicy::fixed(Duration::from_millis(10)),
        },
    )
    .spawn(shutdown_rx);
    let summary = worker.wait().await.unwrap();

    assert_eq!(summary.flushes, 24);
    assert_eq!(summary.events, 237);
    let sizes = sink.batch_sizes();
    assert_eq!(sizes.len(), 24);
    assert!(sizes[..23].iter().all(|&size| size == 10));
    assert_eq!(sizes[23], 7);

    let applied: Vec<OutboxId> = sink.events().iter().map(|e| e.event_id).collect();
    assert_eq!(applied, ids);
    assert_eq!(
        broker.committed("stats-ingest-view", "view").unwrap().next_offset(0),
        Some(237)
    );
}

#[tokio::test(start_paused = true)]
async fn relay_and_worker_run_side_by_side() {
    let outbox = InMemoryOutbox::new();
    let broker = InMemoryBroker::new();
    let sink = InMemorySink::<ViewEvent>::new();
    sink.fail_next(1);
    broker.fail_next_publishes(1);

    let relay = RelayJob::new(
        outbox.clone(),
        Arc::new(broker.clone()),
        RelayConfig {
            interval: Duration::from_millis(100),
            batch_size: 4,
            full_rescan_every: 10,
        },
    )
    .spawn();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let consumer: Arc<dyn BrokerConsumer> = Arc::new(broker.consumer("view", "stats-ingest-view"));
    let mut worker = TopicWorker::new(
        consumer,
        Arc::new(sink.clone()),
        WorkerConfig {
            batch_capacity: 5,
            buffer_capacity: 20,
            flush_interval: Duration::from_millis(250),
            backoff: BackoffPolicy::fixed(Duration::from_millis(50)),
        },
    )
    .spawn(shutdown_rx);

    outbox.seed(&views(0..9));
    tokio::time::sleep(Duration::from_secs(2)).await;
    outbox.seed(&views(9..12));
    tokio::time::sleep(Duration::from_secs(2)).await;

    relay.stop().await;
    shutdown.send(true).unwrap();
    worker.wait().await.unwrap();

    assert_eq!(outbox.unprocessed_count(), 0);
    assert_eq!(sink.len(), 12);
    assert_eq!(
        broker.committed("stats-ingest-view", "view").unwrap().next_offset(0),
        Some(12)
    );
}
