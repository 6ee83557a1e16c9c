//! Orchestrator registration and shutdown

#![allow(clippy::unwrap_used)] // Tests can unwrap

use chrono::Utc;
use outbox_relay_core::broker::{BrokerConsumer, BrokerProducer, BrokerRecord};
use outbox_relay_core::event::{LikeEvent, TopicEvent, ViewEvent};
use outbox_relay_core::outbox::OutboxId;
use outbox_relay_runtime::{BackoffPolicy, Orchestrator, OrchestratorError, WorkerConfig, WorkerState};
use outbox_relay_testing::{InMemoryBroker, InMemoryDeadLetters, InMemorySink};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn config() -> WorkerConfig {
    WorkerConfig {
        batch_capacity: 10,
        buffer_capacity: 10,
        flush_interval: Duration::from_secs(3600),
        backoff: BackoffPolicy::fixed(Duration::from_millis(100)),
    }
}

fn consumer(broker: &InMemoryBroker, topic: &str) -> Arc<dyn BrokerConsumer> {
    Arc::new(broker.consumer(topic, &format!("stats-{topic}")))
}

fn record<E: TopicEvent>(id: i64, event: &E) -> BrokerRecord {
    BrokerRecord {
        topic: E::TOPIC.as_str().to_string(),
        key: E::TOPIC.as_str().to_string(),
        event_id: OutboxId(id),
        created_at: Utc::now(),
        payload: event.encode().unwrap(),
    }
}

fn view(id: i64) -> BrokerRecord {
    record(
        id,
        &ViewEvent {
            post_id: id,
            viewer_id: 1,
            author_id: 2,
            viewed_at: Utc::now(),
        },
    )
}

fn like(id: i64) -> BrokerRecord {
    record(
        id,
        &LikeEvent {
            post_id: id,
            liker_id: 1,
            author_id: 2,
            liked_at: Utc::now(),
        },
    )
}

#[test]
fn second_worker_for_a_topic_is_rejected() {
    let broker = InMemoryBroker::new();
    let sink = Arc::new(InMemorySink::<ViewEvent>::new());
    let mut orchestrator = Orchestrator::new(config(), Duration::from_secs(5));

    orchestrator
        .register::<ViewEvent, _>(consumer(&broker, "view"), Arc::clone(&sink))
        .unwrap();
    let second = orchestrator.register::<ViewEvent, _>(consumer(&broker, "view"), sink);

    assert_eq!(second.err(), Some(OrchestratorError::DuplicateTopic("view".to_string())));
    assert_eq!(orchestrator.topics(), vec!["view".to_string()]);
}

#[test]
fn consumer_must_read_the_event_types_topic() {
    let broker = InMemoryBroker::new();
    let mut orchestrator = Orchestrator::new(config(), Duration::from_secs(5));

    let result = orchestrator.register::<LikeEvent, _>(
        consumer(&broker, "view"),
        Arc::new(InMemorySink::<LikeEvent>::new()),
    );

    assert_eq!(
        result.err(),
        Some(OrchestratorError::TopicMismatch {
            expected: "like".to_string(),
            actual: "view".to_string(),
        })
    );
    assert!(orchestrator.topics().is_empty());
}

#[tokio::test]
async fn start_requires_registered_workers_and_runs_once() {
    let broker = InMemoryBroker::new();
    let mut orchestrator = Orchestrator::new(config(), Duration::from_secs(5));
    assert_eq!(orchestrator.start(), Err(OrchestratorError::NothingRegistered));

    orchestrator
        .register::<ViewEvent, _>(consumer(&broker, "view"), Arc::new(InMemorySink::new()))
        .unwrap();
    assert_ok!(orchestrator.start());
    assert_err!(orchestrator.start());

    let late = orchestrator.register::<LikeEvent, _>(consumer(&broker, "like"), Arc::new(InMemorySink::new()));
    assert_eq!(late.err(), Some(OrchestratorError::AlreadyStarted));

    let report = orchestrator.shutdown().await;
    assert!(report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_every_worker() {
    let broker = InMemoryBroker::new();
    let views = Arc::new(InMemorySink::<ViewEvent>::new());
    let likes = Arc::new(InMemorySink::<LikeEvent>::new());
    broker.publish_batch(&[view(1), view(2), like(3)]).await.unwrap();

    let mut orchestrator = Orchestrator::new(config(), Duration::from_secs(5));
    orchestrator
        .register::<ViewEvent, _>(consumer(&broker, "view"), Arc::clone(&views))
        .unwrap()
        .register::<LikeEvent, _>(consumer(&broker, "like"), Arc::clone(&likes))
        .unwrap();
    orchestrator.start().unwrap();
    assert_eq!(orchestrator.topics(), vec!["like".to_string(), "view".to_string()]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(views.is_empty(), "partial batches wait for the flush interval");
    assert!(
        orchestrator
            .states()
            .iter()
            .all(|(_, state)| *state == WorkerState::Filling)
    );

    let report = orchestrator.shutdown().await;

    assert!(report.is_clean());
    let drained: Vec<(&str, usize)> = report
        .drained
        .iter()
        .map(|(topic, summary)| (topic.as_str(), summary.events))
        .collect();
    assert_eq!(drained, vec![("like", 1), ("view", 2)]);
    assert_eq!(views.len(), 2);
    assert_eq!(likes.len(), 1);
    assert_eq!(broker.committed("stats-view", "view").unwrap().next_offset(0), Some(2));
    assert_eq!(broker.committed("stats-like", "like").unwrap().next_offset(0), Some(1));
}

#[tokio::test(start_paused = true)]
async fn worker_stuck_on_a_down_sink_is_aborted_and_redelivered() {
    let broker = InMemoryBroker::new();
    let sink = Arc::new(InMemorySink::<ViewEvent>::new());
    sink.set_available(false);
    broker.publish_batch(&[view(1), view(2)]).await.unwrap();

    let mut orchestrator = Orchestrator::new(config(), Duration::from_secs(2));
    orchestrator
        .register::<ViewEvent, _>(consumer(&broker, "view"), Arc::clone(&sink))
        .unwrap();
    orchestrator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = orchestrator.shutdown().await;
    assert_eq!(report.aborted, vec!["view".to_string()]);
    assert!(report.drained.is_empty());
    assert!(broker.committed("stats-view", "view").is_none());

    // The next process resumes from the last checkpoint and gets both again.
    sink.set_available(true);
    broker.close();
    let mut restarted = Orchestrator::new(config(), Duration::from_secs(2));
    restarted
        .register::<ViewEvent, _>(consumer(&broker, "view"), Arc::clone(&sink))
        .unwrap();
    restarted.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = restarted.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(sink.len(), 2);
    assert_eq!(broker.committed("stats-view", "view").unwrap().next_offset(0), Some(2));
}

#[tokio::test(start_paused = true)]
async fn dead_letters_apply_to_every_registered_worker() {
    let broker = InMemoryBroker::new();
    let dead_letters = InMemoryDeadLetters::new();
    let garbage = BrokerRecord {
        payload: vec![0xff],
        ..like(7)
    };
    broker.publish_batch(&[garbage, view(8)]).await.unwrap();
    broker.close();

    let mut orchestrator =
        Orchestrator::new(config(), Duration::from_secs(5)).with_dead_letters(Arc::new(dead_letters.clone()));
    orchestrator
        .register::<ViewEvent, _>(consumer(&broker, "view"), Arc::new(InMemorySink::new()))
        .unwrap()
        .register::<LikeEvent, _>(consumer(&broker, "like"), Arc::new(InMemorySink::new()))
        .unwrap();
    orchestrator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = orchestrator.shutdown().await;

    assert!(report.is_clean());
    let quarantined = dead_letters.messages();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].topic, "like");
    assert_eq!(quarantined[0].group, "stats-like");
}
