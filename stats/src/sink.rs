//! `PostgreSQL` stats sink.

use crate::fact::StatsEvent;
use outbox_relay_core::event::Topic;
use outbox_relay_core::sink::{Envelope, EventSink, SinkError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

/// Rows per INSERT statement, well under the bind parameter limit.
const ROWS_PER_STATEMENT: usize = 1000;

/// Stats sink writing every catalog topic into `stats_events`.
///
/// One sink serves all topic workers: it implements [`EventSink`] for every
/// [`StatsEvent`]. A batch is written in one transaction and rows already
/// present (same topic and outbox id) are skipped, so a redelivered batch
/// changes nothing.
///
/// # Example
///
/// ```ignore
/// let stats = Arc::new(PostgresStatsSink::new(pool));
/// orchestrator
///     .register::<ViewEvent, _>(views, Arc::clone(&stats))?
///     .register::<LikeEvent, _>(likes, Arc::clone(&stats))?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresStatsSink {
    pool: PgPool,
}

impl PostgresStatsSink {
    /// Create a sink over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a sink with its own connection pool, e.g. on an analytics database.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Unavailable`] if connection fails.
    pub async fn new_with_separate_db(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| SinkError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Access the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Number of stored events for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the query fails.
    pub async fn count(&self, topic: Topic) -> Result<i64, SinkError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stats_events WHERE topic = $1")
            .bind(topic.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(count)
    }

    /// Number of stored `topic` events on one post (views, likes or comments).
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the query fails.
    pub async fn post_count(&self, topic: Topic, post_id: i64) -> Result<i64, SinkError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stats_events WHERE topic = $1 AND post_id = $2")
                .bind(topic.as_str())
                .bind(post_id)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(count)
    }
}

fn storage_error(e: sqlx::Error) -> SinkError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            SinkError::Unavailable(e.to_string())
        }
        other => SinkError::Storage(other.to_string()),
    }
}

impl<E: StatsEvent> EventSink<E> for PostgresStatsSink {
    async fn apply(&self, batch: &[Envelope<E>]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let topic = E::TOPIC.as_str();

        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let mut inserted = 0u64;
        for chunk in batch.chunks(ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO stats_events (topic, event_id, actor_id, post_id, author_id, occurred_at, relayed_at) ",
            );
            query.push_values(chunk, |mut row, envelope| {
                let fact = envelope.event.fact();
                row.push_bind(topic)
                    .push_bind(envelope.event_id.0)
                    .push_bind(fact.actor_id)
                    .push_bind(fact.post_id)
                    .push_bind(fact.author_id)
                    .push_bind(fact.occurred_at)
                    .push_bind(envelope.created_at);
            });
            query.push(" ON CONFLICT (topic, event_id) DO NOTHING");

            inserted += query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?
                .rows_affected();
        }
        tx.commit().await.map_err(storage_error)?;

        let duplicates = u64::try_from(batch.len()).unwrap_or(u64::MAX).saturating_sub(inserted);
        tracing::debug!(topic, batch = batch.len(), inserted, duplicates, "Stats batch stored");
        if duplicates > 0 {
            tracing::info!(topic, duplicates, "Skipped redelivered events");
        }
        Ok(())
    }
}
