//! Outbox table access.

use chrono::{DateTime, Utc};
use outbox_relay_core::checkpoint::RelayCursor;
use outbox_relay_core::outbox::{
    NewOutboxEvent, OutboxError, OutboxEvent, OutboxId, OutboxWriter, RelayStore, RelayTransaction,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

#[derive(FromRow)]
struct OutboxRow {
    id: i64,
    event_type: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    processed: bool,
}

impl From<OutboxRow> for OutboxEvent {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: OutboxId(row.id),
            event_type: row.event_type,
            payload: row.payload,
            created_at: row.created_at,
            processed: row.processed,
        }
    }
}

/// `PostgreSQL` outbox.
///
/// Writers insert through the caller's own transaction. The relay side opens
/// its own transactions from the pool.
///
/// # Example
///
/// ```ignore
/// let outbox = PostgresOutbox::new(pool.clone());
///
/// let mut tx = pool.begin().await?;
/// // ... business writes on &mut *tx ...
/// outbox.record(&mut tx, &ViewEvent { post_id, viewer_id, author_id, viewed_at }).await?;
/// tx.commit().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create an outbox over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Number of rows not yet relayed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    pub async fn unprocessed_count(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_events WHERE processed = false")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(count)
    }
}

impl OutboxWriter for PostgresOutbox {
    type Transaction = Transaction<'static, Postgres>;

    async fn put(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        event: NewOutboxEvent,
    ) -> Result<OutboxId, OutboxError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO outbox_events (event_type, payload)
            VALUES ($1, $2)
            RETURNING id
            ",
        )
        .bind(&event.event_type)
        .bind(&event.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        tracing::trace!(id, event_type = %event.event_type, "Outbox row inserted");
        Ok(OutboxId(id))
    }
}

impl RelayStore for PostgresOutbox {
    type Transaction = PostgresRelayTransaction;

    async fn begin(&self) -> Result<PostgresRelayTransaction, OutboxError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OutboxError::Begin(e.to_string()))?;
        Ok(PostgresRelayTransaction { tx })
    }
}

/// One relay tick's transaction.
///
/// Dropping it without committing rolls back on the connection, releasing
/// the row locks.
pub struct PostgresRelayTransaction {
    tx: Transaction<'static, Postgres>,
}

impl RelayTransaction for PostgresRelayTransaction {
    /// `created_at >= $1` rather than `>`: a batch cut by `LIMIT` in the middle
    /// of a run of equal timestamps leaves the rest of the run at the cursor.
    /// The boundary rows already relayed cost one index probe each tick.
    async fn claim_batch(
        &mut self,
        cursor: Option<RelayCursor>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows: Vec<OutboxRow> = sqlx::query_as(
            r"
            WITH claimed AS (
                SELECT id
                FROM outbox_events
                WHERE processed = false
                  AND ($1::timestamptz IS NULL OR created_at >= $1)
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET processed = true
            FROM claimed
            WHERE o.id = claimed.id
            RETURNING o.id, o.event_type, o.payload, o.created_at, o.processed
            ",
        )
        .bind(cursor.map(|c| c.created_at))
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        // RETURNING has no defined order.
        rows.sort_by_key(|row| (row.created_at, row.id));
        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn commit(self) -> Result<(), OutboxError> {
        self.tx
            .commit()
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))
    }

    async fn rollback(self) -> Result<(), OutboxError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))
    }
}
