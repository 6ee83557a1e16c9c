//! Tests wiring the in-memory collaborators together by hand

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use outbox_relay_core::broker::{BrokerConsumer, BrokerProducer, BrokerRecord};
use outbox_relay_core::checkpoint::{Checkpoint, RelayCursor};
use outbox_relay_core::environment::Clock;
use outbox_relay_core::event::{CommentEvent, TopicEvent};
use outbox_relay_core::outbox::{RelayStore, RelayTransaction};
use outbox_relay_testing::{InMemoryBroker, InMemoryOutbox, test_clock};

fn comments(n: i64) -> Vec<CommentEvent> {
    (1..=n)
        .map(|i| CommentEvent {
            comment_id: i,
            post_id: 10,
            commenter_id: 20 + i,
            author_id: 30,
            commented_at: test_clock().now(),
        })
        .collect()
}

#[tokio::test]
async fn claimed_rows_reach_the_consumer_with_their_outbox_ids() {
    let outbox = InMemoryOutbox::new();
    let broker = InMemoryBroker::new();
    let ids = outbox.seed(&comments(3));

    let mut tx = outbox.begin().await.unwrap();
    let rows = tx.claim_batch(None, 10).await.unwrap();
    let records: Vec<BrokerRecord> = rows.iter().map(BrokerRecord::from_outbox).collect();
    broker.publish_batch(&records).await.unwrap();
    tx.commit().await.unwrap();
    broker.close();

    let consumer = broker.consumer("comment", "stats-comment");
    let mut handles = Vec::new();
    let mut received = Vec::new();
    while let Some(record) = consumer.fetch().await {
        let record = record.unwrap();
        handles.push(record.handle);
        received.push(record.event_id);
        let event = CommentEvent::decode(&record.payload).expect("relay keeps payload intact");
        assert_eq!(event.post_id, 10);
    }

    assert_eq!(received, ids);
    assert_eq!(outbox.unprocessed_count(), 0);

    consumer.commit(&Checkpoint::covering(&handles)).await.unwrap();
    let committed = broker.committed("stats-comment", "comment").unwrap();
    assert_eq!(committed.next_offset(0), Some(3));
}

#[tokio::test]
async fn cursor_from_a_committed_batch_hides_only_processed_rows() {
    let outbox = InMemoryOutbox::new();
    outbox.seed(&comments(4));

    let mut tx = outbox.begin().await.unwrap();
    let first = tx.claim_batch(None, 2).await.unwrap();
    tx.commit().await.unwrap();
    let cursor = RelayCursor::after_batch(&first);

    let mut tx = outbox.begin().await.unwrap();
    let second = tx.claim_batch(cursor, 10).await.unwrap();
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|row| first.iter().all(|f| f.id != row.id)));
}
