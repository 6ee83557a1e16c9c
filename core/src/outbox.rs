//! Transactional outbox abstractions.
//!
//! The outbox is a table living in the same database as the business data. A
//! business transaction inserts an outbox row next to the mutation it describes,
//! so the row exists if and only if the mutation committed. A relay later drains
//! unprocessed rows and publishes them to the broker.
//!
//! # Two seams
//!
//! - [`OutboxWriter`]: used on the request path, inside an already-open business
//!   transaction. It only inserts; it never publishes.
//! - [`RelayStore`] / [`RelayTransaction`]: used by the relay job. A relay
//!   transaction claims a bounded batch under row locks that concurrent relays
//!   skip, marks the rows processed, and is committed only after the broker has
//!   accepted the batch.
//!
//! # Implementations
//!
//! - `PostgresOutbox` (in `outbox-relay-postgres`): production, `FOR UPDATE SKIP LOCKED`
//! - `InMemoryOutbox` (in `outbox-relay-testing`): deterministic tests
//!
//! # Example
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! sqlx::query("INSERT INTO post_likes (post_id, profile_id) VALUES ($1, $2)")
//!     .bind(post_id)
//!     .bind(profile_id)
//!     .execute(&mut *tx)
//!     .await?;
//!
//! // Same transaction: the like and its event commit or roll back together.
//! outbox.record(&mut tx, &LikeEvent { post_id, liker_id: profile_id, author_id, liked_at }).await?;
//! tx.commit().await?;
//! ```

use crate::checkpoint::RelayCursor;
use crate::event::{EventError, TopicEvent};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Could not open a transaction (pool exhausted, connection refused).
    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    /// Failed to encode the event payload before insertion.
    #[error(transparent)]
    Encode(#[from] EventError),
}

/// Ordering key of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutboxId(pub i64);

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event about to be written to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// Topic name (see [`crate::event::Topic::as_str`])
    pub event_type: String,
    /// Encoded event, opaque to the outbox and the relay
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    /// Encode a catalog event for insertion.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if the event cannot be serialized.
    pub fn from_event<E: TopicEvent>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: E::TOPIC.as_str().to_string(),
            payload: event.encode()?,
        })
    }
}

/// A row of the outbox table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Ordering key
    pub id: OutboxId,
    /// Topic name; the relay publishes the row to this topic
    pub event_type: String,
    /// Encoded event
    pub payload: Vec<u8>,
    /// Insertion time, used for relay ordering
    pub created_at: DateTime<Utc>,
    /// Flipped false → true exactly once, by the relay transaction that published it
    pub processed: bool,
}

/// Inserts outbox rows inside a caller-owned business transaction.
///
/// # Contract
///
/// - `put` must be called with a transaction that is already open.
/// - The row becomes visible to relays only when that transaction commits.
/// - On error the caller must roll back the whole business transaction, so the
///   event and its triggering mutation stay atomic.
pub trait OutboxWriter: Send + Sync {
    /// The enclosing transaction type (e.g. `sqlx::Transaction<'static, Postgres>`).
    type Transaction: Send;

    /// Insert an outbox row within `tx`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transaction error as [`OutboxError::Database`].
    fn put(
        &self,
        tx: &mut Self::Transaction,
        event: NewOutboxEvent,
    ) -> impl Future<Output = Result<OutboxId, OutboxError>> + Send;

    /// Encode a catalog event and insert it within `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Encode`] if the event cannot be encoded, or the
    /// error of [`OutboxWriter::put`].
    fn record<E: TopicEvent>(
        &self,
        tx: &mut Self::Transaction,
        event: &E,
    ) -> impl Future<Output = Result<OutboxId, OutboxError>> + Send {
        let encoded = NewOutboxEvent::from_event(event);
        async move { self.put(tx, encoded?).await }
    }
}

/// Opens relay transactions against the outbox.
pub trait RelayStore: Send + Sync {
    /// Transaction type handed to the relay for one tick.
    type Transaction: RelayTransaction;

    /// Open a new relay transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Begin`] if no connection or transaction can be acquired.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, OutboxError>> + Send;
}

/// One relay tick's view of the outbox.
///
/// Row locks taken by [`RelayTransaction::claim_batch`] are held until
/// [`commit`](RelayTransaction::commit) or [`rollback`](RelayTransaction::rollback).
/// Dropping the transaction without committing is a rollback.
pub trait RelayTransaction: Send {
    /// Select up to `limit` unprocessed rows, oldest first, locking them and
    /// skipping rows already locked by another relay, then mark them processed.
    ///
    /// When `cursor` is set only rows with `created_at >= cursor` are scanned.
    /// The cursor narrows the scan; the `processed` flag alone decides which
    /// rows are eligible.
    ///
    /// The bound is inclusive: rows sharing the cursor's timestamp with the
    /// last batch but left out of it by `limit` must stay visible. Rows at
    /// the boundary that were already relayed are re-scanned and dropped by
    /// `processed = false`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the select or update fails.
    fn claim_batch(
        &mut self,
        cursor: Option<RelayCursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send;

    /// Make the claimed rows permanently processed and release their locks.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the commit fails; the rows then stay unprocessed.
    fn commit(self) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// Discard the processed marks and release the locks.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the rollback statement fails.
    fn rollback(self) -> impl Future<Output = Result<(), OutboxError>> + Send;
}
