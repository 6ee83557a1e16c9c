//! In-memory broker.
//!
//! Each topic is a single partition (partition `0`) whose offsets are vector
//! indices. Consumer groups resume from their last committed offset, so
//! dropping a consumer and creating a new one simulates a consumer restart.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use outbox_relay_core::broker::{
    BrokerConsumer, BrokerError, BrokerFuture, BrokerProducer, BrokerRecord, CommitHandle,
    ConsumerRecord,
};
use outbox_relay_core::checkpoint::Checkpoint;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const PARTITION: i32 = 0;

type GroupTopic = (String, String);

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<ConsumerRecord>>,
    committed: HashMap<GroupTopic, Checkpoint>,
    commit_log: HashMap<GroupTopic, Vec<Checkpoint>>,
    positions: HashMap<GroupTopic, i64>,
    closed: bool,
    fail_publishes: u32,
    fail_fetches: u32,
    fail_commits: u32,
    publish_attempts: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory broker implementing [`BrokerProducer`], handing out
/// [`InMemoryConsumer`]s.
///
/// Cloning shares the underlying topics.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a broker with no topics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a consumer for `topic` in consumer group `group`.
    ///
    /// Starts at the group's committed offset, or at the beginning of the topic.
    #[must_use]
    pub fn consumer(&self, topic: &str, group: &str) -> InMemoryConsumer {
        let key = (group.to_string(), topic.to_string());
        let mut state = self.inner.state.lock().unwrap();
        let start = state
            .committed
            .get(&key)
            .and_then(|checkpoint| checkpoint.next_offset(PARTITION))
            .unwrap_or(0);
        state.positions.insert(key, start);
        InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
        }
    }

    /// End every stream: consumers return `None` once they have read everything.
    pub fn close(&self) {
        self.inner.state.lock().unwrap().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Make the next `n` batch publishes fail without writing anything.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.state.lock().unwrap().fail_publishes = n;
    }

    /// Make the next `n` fetches (across all consumers) fail.
    pub fn fail_next_fetches(&self, n: u32) {
        self.inner.state.lock().unwrap().fail_fetches = n;
    }

    /// Make the next `n` checkpoint commits (across all consumers) fail.
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.state.lock().unwrap().fail_commits = n;
    }

    /// Append a message whose outbox headers could not be read.
    pub fn publish_malformed(&self, topic: &str, payload: Vec<u8>, reason: &str) {
        let mut state = self.inner.state.lock().unwrap();
        let log = state.topics.entry(topic.to_string()).or_default();
        let offset = i64::try_from(log.len()).unwrap();
        log.push(ConsumerRecord::malformed(
            CommitHandle::new(PARTITION, offset),
            payload,
            reason,
        ));
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Messages retained on `topic`, in offset order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<ConsumerRecord> {
        self.inner
            .state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of messages retained on `topic`.
    #[must_use]
    pub fn message_count(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Number of `publish_batch` calls, including failed ones.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.inner.state.lock().unwrap().publish_attempts
    }

    /// Last committed checkpoint of `group` on `topic`.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str) -> Option<Checkpoint> {
        self.inner
            .state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .cloned()
    }

    /// Every successful commit of `group` on `topic`, in order.
    #[must_use]
    pub fn commit_log(&self, group: &str, topic: &str) -> Vec<Checkpoint> {
        self.inner
            .state
            .lock()
            .unwrap()
            .commit_log
            .get(&(group.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset `group` will read on `topic` (how far its consumer has fetched).
    #[must_use]
    pub fn position(&self, group: &str, topic: &str) -> i64 {
        self.inner
            .state
            .lock()
            .unwrap()
            .positions
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl BrokerProducer for InMemoryBroker {
    fn publish_batch<'a>(&'a self, records: &'a [BrokerRecord]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            state.publish_attempts += 1;
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BrokerError::PublishFailed {
                    topic: records
                        .first()
                        .map(|r| r.topic.clone())
                        .unwrap_or_default(),
                    reason: "injected publish failure".to_string(),
                });
            }
            for record in records {
                let log = state.topics.entry(record.topic.clone()).or_default();
                let offset = i64::try_from(log.len()).unwrap();
                log.push(ConsumerRecord::new(
                    CommitHandle::new(PARTITION, offset),
                    record.event_id,
                    record.created_at,
                    record.payload.clone(),
                ));
            }
            drop(state);
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }
}

/// Consumer of one topic for one consumer group.
#[derive(Debug)]
pub struct InMemoryConsumer {
    inner: Arc<Inner>,
    topic: String,
    group: String,
}

impl InMemoryConsumer {
    fn key(&self) -> GroupTopic {
        (self.group.clone(), self.topic.clone())
    }

    fn poll(&self) -> Option<Option<Result<ConsumerRecord, BrokerError>>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Some(Some(Err(BrokerError::FetchFailed {
                topic: self.topic.clone(),
                reason: "injected fetch failure".to_string(),
            })));
        }
        let key = self.key();
        let position = state.positions.get(&key).copied().unwrap_or(0);
        let next = state
            .topics
            .get(&self.topic)
            .and_then(|log| log.get(usize::try_from(position).unwrap()))
            .cloned();
        match next {
            Some(record) => {
                state.positions.insert(key, position + 1);
                Some(Some(Ok(record)))
            }
            None if state.closed => Some(None),
            None => None,
        }
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn fetch(&self) -> Pin<Box<dyn Future<Output = Option<Result<ConsumerRecord, BrokerError>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(result) = self.poll() {
                    return result;
                }
                notified.await;
            }
        })
    }

    fn commit<'a>(&'a self, checkpoint: &'a Checkpoint) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            if state.fail_commits > 0 {
                state.fail_commits -= 1;
                return Err(BrokerError::CommitFailed {
                    group: self.group.clone(),
                    reason: "injected commit failure".to_string(),
                });
            }
            let key = self.key();
            let committed = state.committed.entry(key.clone()).or_default();
            for (partition, next) in checkpoint.iter() {
                committed.include(CommitHandle::new(partition, next - 1));
            }
            state.commit_log.entry(key).or_default().push(checkpoint.clone());
            Ok(())
        })
    }
}
