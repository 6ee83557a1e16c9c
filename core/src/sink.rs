//! Consumer-side destinations: the analytical sink and the dead-letter store.
//!
//! A topic worker hands each flushed batch to an [`EventSink`] and commits the
//! broker checkpoint only after `apply` succeeds. Messages whose payload cannot
//! be decoded never reach the sink; they go to a [`DeadLetterSink`] instead and
//! are checkpointed with the batch they arrived in.
//!
//! # Idempotency
//!
//! Sink-apply and checkpoint-commit are not atomic. A crash between the two
//! redelivers the batch after restart, so every sink must deduplicate on
//! `(topic, event_id)`; the Postgres stats sink does this with
//! `ON CONFLICT DO NOTHING`.
//!
//! # Example
//!
//! ```ignore
//! struct ViewCounter {
//!     pool: PgPool,
//! }
//!
//! impl EventSink<ViewEvent> for ViewCounter {
//!     async fn apply(&self, batch: &[Envelope<ViewEvent>]) -> Result<(), SinkError> {
//!         let mut tx = self.pool.begin().await.map_err(|e| SinkError::Unavailable(e.to_string()))?;
//!         for envelope in batch {
//!             // INSERT ... ON CONFLICT (topic, event_id) DO NOTHING
//!         }
//!         tx.commit().await.map_err(|e| SinkError::Storage(e.to_string()))
//!     }
//! }
//! ```

use crate::broker::CommitHandle;
use crate::event::{Topic, TopicEvent};
use crate::outbox::OutboxId;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by sinks and dead-letter stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The backing store could not be reached
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// The write was attempted and failed
    #[error("Storage error: {0}")]
    Storage(String),
}

/// A decoded event together with the metadata the relay attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<E> {
    /// Outbox id of the originating row, the deduplication key within a topic
    pub event_id: OutboxId,
    /// When the outbox row was written
    pub created_at: DateTime<Utc>,
    /// The event itself
    pub event: E,
}

impl<E: TopicEvent> Envelope<E> {
    /// Topic the event belongs to.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        E::TOPIC
    }
}

/// Batched write interface of the analytical store.
///
/// # Contract
///
/// - `apply` succeeds or fails for the whole batch.
/// - Applying the same `(topic, event_id)` twice has the effect of applying it once.
/// - Batches arrive in broker order; an empty batch is never passed.
pub trait EventSink<E: TopicEvent>: Send + Sync + 'static {
    /// Write a batch of events.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the batch was not durably written. The worker
    /// retries the same batch with backoff and does not advance its checkpoint.
    fn apply(&self, batch: &[Envelope<E>]) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// A message that could not be decoded, set aside for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedMessage {
    /// Topic it was consumed from
    pub topic: String,
    /// Consumer group that rejected it
    pub group: String,
    /// Broker position of the message
    pub handle: CommitHandle,
    /// Outbox id carried in the message headers, `None` if they were unreadable
    pub event_id: Option<OutboxId>,
    /// Raw payload, as received
    pub payload: Vec<u8>,
    /// Why decoding failed
    pub error: String,
}

/// Store for messages the worker gave up on.
///
/// Quarantine is best effort: if it fails the worker logs and moves on, the
/// message is still skipped.
pub trait DeadLetterSink: Send + Sync {
    /// Record a quarantined message.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the message could not be stored.
    fn quarantine(
        &self,
        message: QuarantinedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;
}
