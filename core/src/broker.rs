//! Broker abstraction for the partitioned log between relay and topic workers.
//!
//! The relay publishes outbox rows through a [`BrokerProducer`]; each topic
//! worker reads its topic through its own [`BrokerConsumer`] (one consumer group
//! per service and topic) and commits a [`Checkpoint`] once a batch is applied.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish_batch    ┌──────────────┐
//! │  Relay Job   │ ─────────────────► │    Broker    │  one topic per event_type,
//! │ (outbox rows)│   acks = all       │ (Redpanda)   │  key = topic
//! └──────────────┘                    └──────┬───────┘
//!                                            │ fetch / commit(checkpoint)
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │ Topic Worker │
//!                                     └──────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once**: a batch publish is accepted only when every record is
//!   acknowledged by all replicas; anything less is a failure and the relay
//!   retries the whole batch.
//! - **Ordered within a topic**: records are keyed by topic, so a topic's
//!   records share a partition and keep relay order.
//! - **Checkpoint after apply**: consumers commit only after the sink applied
//!   the batch, so a crash redelivers instead of dropping.
//!
//! # Implementations
//!
//! - `InMemoryBroker` (in `outbox-relay-testing`): failure injection, end-of-stream
//! - `RedpandaProducer` / `RedpandaConsumer` (in `outbox-relay-redpanda`): production

use crate::checkpoint::Checkpoint;
use crate::outbox::{OutboxEvent, OutboxId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to or configure the broker client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not acknowledge a record of the batch
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to read the next message
    #[error("Fetch failed for topic '{topic}': {reason}")]
    FetchFailed {
        /// The topic being consumed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit consumer offsets
    #[error("Commit failed for group '{group}': {reason}")]
    CommitFailed {
        /// The consumer group
        group: String,
        /// The reason for failure
        reason: String,
    },

    /// A message is missing required metadata (event id, timestamp)
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}

impl BrokerError {
    /// `true` if retrying the same operation later may succeed.
    ///
    /// Configuration and topic errors are permanent; everything that depends on
    /// broker availability is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::PublishFailed { .. } | Self::FetchFailed { .. } | Self::CommitFailed { .. } => true,
            Self::ConnectionFailed(_) | Self::MalformedMessage(_) | Self::InvalidTopic(_) => false,
        }
    }
}

/// A message about to be published by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    /// Destination topic (the outbox row's `event_type`)
    pub topic: String,
    /// Partitioning key
    pub key: String,
    /// Outbox id, carried as a header so consumers can deduplicate
    pub event_id: OutboxId,
    /// Outbox `created_at`, carried as a header
    pub created_at: DateTime<Utc>,
    /// Encoded event
    pub payload: Vec<u8>,
}

impl BrokerRecord {
    /// Translate an outbox row into a broker record.
    #[must_use]
    pub fn from_outbox(row: &OutboxEvent) -> Self {
        Self {
            topic: row.event_type.clone(),
            key: row.event_type.clone(),
            event_id: row.id,
            created_at: row.created_at,
            payload: row.payload.clone(),
        }
    }
}

/// Opaque position of a consumed message, used to build a [`Checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitHandle {
    /// Partition the message was read from
    pub partition: i32,
    /// Offset of the message within its partition
    pub offset: i64,
}

impl CommitHandle {
    /// Create a handle.
    #[must_use]
    pub const fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

/// A message read from a topic, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    /// Where the message sits in the topic
    pub handle: CommitHandle,
    /// Outbox id of the originating row
    pub event_id: OutboxId,
    /// Outbox `created_at` of the originating row
    pub created_at: DateTime<Utc>,
    /// Encoded event
    pub payload: Vec<u8>,
    /// Why the outbox headers could not be read, if they could not.
    ///
    /// A malformed record carries a zero `event_id` and the epoch as
    /// `created_at`; workers quarantine it without decoding the payload.
    pub malformed: Option<String>,
}

impl ConsumerRecord {
    /// A record with readable outbox headers.
    #[must_use]
    pub const fn new(
        handle: CommitHandle,
        event_id: OutboxId,
        created_at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            handle,
            event_id,
            created_at,
            payload,
            malformed: None,
        }
    }

    /// A record whose outbox headers are missing or unreadable.
    #[must_use]
    pub fn malformed(handle: CommitHandle, payload: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            handle,
            event_id: OutboxId(0),
            created_at: DateTime::UNIX_EPOCH,
            payload,
            malformed: Some(reason.into()),
        }
    }
}

/// Future returned by the broker traits.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Publishing side of the broker.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the relay can hold an
/// `Arc<dyn BrokerProducer>`.
pub trait BrokerProducer: Send + Sync {
    /// Publish every record of `records`, each to its own topic.
    ///
    /// Succeeds only if every record was acknowledged by all in-sync replicas.
    /// On failure some records may already have been written; the caller
    /// republishes the whole batch, and consumers tolerate the duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if any record is not acknowledged.
    fn publish_batch<'a>(&'a self, records: &'a [BrokerRecord]) -> BrokerFuture<'a, ()>;
}

/// Consuming side of the broker, bound to one topic and one consumer group.
///
/// `fetch` and `commit` take `&self` so a worker's fetch task and flush task
/// can share one consumer.
pub trait BrokerConsumer: Send + Sync {
    /// The topic this consumer reads.
    fn topic(&self) -> &str;

    /// The consumer group whose checkpoint this consumer advances.
    fn group(&self) -> &str;

    /// Wait for the next message.
    ///
    /// Returns `None` once the upstream stream has ended.
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Option<Result<ConsumerRecord, BrokerError>>> + Send + '_>>;

    /// Durably record `checkpoint` for this consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the broker rejects the commit.
    fn commit<'a>(&'a self, checkpoint: &'a Checkpoint) -> BrokerFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_routed_and_keyed_by_event_type() {
        let row = OutboxEvent {
            id: OutboxId(17),
            event_type: "comment".to_string(),
            payload: vec![1, 2, 3],
            created_at: Utc::now(),
            processed: true,
        };
        let record = BrokerRecord::from_outbox(&row);
        assert_eq!(record.topic, "comment");
        assert_eq!(record.key, "comment");
        assert_eq!(record.event_id, OutboxId(17));
        assert_eq!(record.created_at, row.created_at);
        assert_eq!(record.payload, row.payload);
    }

    #[test]
    fn malformed_record_keeps_its_position_and_reason() {
        let record = ConsumerRecord::malformed(CommitHandle::new(2, 40), vec![9], "no headers");
        assert_eq!(record.handle, CommitHandle::new(2, 40));
        assert_eq!(record.malformed.as_deref(), Some("no headers"));
        assert_eq!(record.payload, vec![9]);
        assert!(ConsumerRecord::new(record.handle, OutboxId(1), Utc::now(), vec![]).malformed.is_none());
    }

    #[test]
    fn availability_errors_are_transient() {
        let publish = BrokerError::PublishFailed {
            topic: "view".to_string(),
            reason: "timeout".to_string(),
        };
        let commit = BrokerError::CommitFailed {
            group: "stats-view".to_string(),
            reason: "coordinator moved".to_string(),
        };
        assert!(publish.is_transient());
        assert!(commit.is_transient());
        assert!(!BrokerError::InvalidTopic("nope".to_string()).is_transient());
        assert!(!BrokerError::ConnectionFailed("bad config".to_string()).is_transient());
    }
}
