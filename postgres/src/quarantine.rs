//! Quarantine for messages a topic worker could not decode.
//!
//! The worker checkpoints past a quarantined message, so this table is the
//! only remaining copy of it. Entries stay `pending` until an operator
//! resolves or discards them.

use chrono::{DateTime, Utc};
use outbox_relay_core::broker::CommitHandle;
use outbox_relay_core::outbox::OutboxId;
use outbox_relay_core::sink::{DeadLetterSink, QuarantinedMessage, SinkError};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Review status of a quarantined message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineStatus {
    /// Waiting for investigation
    Pending,
    /// Fixed and replayed by an operator
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl QuarantineStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, SinkError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(SinkError::Storage(format!("Invalid quarantine status: {s}"))),
        }
    }
}

/// A row of the quarantine table.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    /// Unique identifier for this entry
    pub id: i64,
    /// The message as the worker rejected it
    pub message: QuarantinedMessage,
    /// When it was quarantined
    pub quarantined_at: DateTime<Utc>,
    /// Current review status
    pub status: QuarantineStatus,
    /// When it was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed [`DeadLetterSink`].
///
/// Quarantining the same broker position twice (after a redelivery) keeps
/// the first entry.
#[derive(Clone, Debug)]
pub struct PostgresQuarantine {
    pool: PgPool,
}

impl PostgresQuarantine {
    /// Create a quarantine over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a message. Returns `false` if its broker position was already stored.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the insert fails.
    pub async fn add_entry(&self, message: &QuarantinedMessage) -> Result<bool, SinkError> {
        let result = sqlx::query(
            r#"
            INSERT INTO quarantined_messages (
                topic, consumer_group, partition, "offset", event_id, payload, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (consumer_group, topic, partition, "offset") DO NOTHING
            "#,
        )
        .bind(&message.topic)
        .bind(&message.group)
        .bind(message.handle.partition)
        .bind(message.handle.offset)
        .bind(message.event_id.map(|id| id.0))
        .bind(&message.payload)
        .bind(&message.error)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::Storage(e.to_string()))?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            tracing::warn!(
                topic = %message.topic,
                group = %message.group,
                partition = message.handle.partition,
                offset = message.handle.offset,
                event_id = ?message.event_id,
                error = %message.error,
                "Message quarantined"
            );
            metrics::counter!("quarantine_entries_stored_total", "topic" => message.topic.clone())
                .increment(1);
        }
        Ok(inserted)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<QuarantineEntry>, SinkError> {
        self.list_by_status(QuarantineStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: QuarantineStatus,
        limit: usize,
    ) -> Result<Vec<QuarantineEntry>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, topic, consumer_group, partition, "offset", event_id, payload,
                error_message, quarantined_at, status, resolved_at, resolution_notes
            FROM quarantined_messages
            WHERE status = $1
            ORDER BY quarantined_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SinkError::Storage(e.to_string()))?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, SinkError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM quarantined_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| SinkError::Storage(e.to_string()))?;
        Ok(count)
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the update fails.
    pub async fn mark_resolved(&self, id: i64, notes: Option<&str>) -> Result<(), SinkError> {
        self.close_entry(id, QuarantineStatus::Resolved, notes).await?;
        tracing::info!(quarantine_id = id, "Quarantine entry resolved");
        Ok(())
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), SinkError> {
        self.close_entry(id, QuarantineStatus::Discarded, Some(reason))
            .await?;
        tracing::warn!(quarantine_id = id, reason, "Quarantine entry discarded");
        Ok(())
    }

    async fn close_entry(
        &self,
        id: i64,
        status: QuarantineStatus,
        notes: Option<&str>,
    ) -> Result<(), SinkError> {
        sqlx::query(
            r"
            UPDATE quarantined_messages
            SET status = $1, resolved_at = NOW(), resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(status.as_str())
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::Storage(e.to_string()))?;
        Ok(())
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<QuarantineEntry, SinkError> {
        let status: String = row.get("status");
        Ok(QuarantineEntry {
            id: row.get("id"),
            message: QuarantinedMessage {
                topic: row.get("topic"),
                group: row.get("consumer_group"),
                handle: CommitHandle::new(row.get("partition"), row.get("offset")),
                event_id: row.get::<Option<i64>, _>("event_id").map(OutboxId),
                payload: row.get("payload"),
                error: row.get("error_message"),
            },
            quarantined_at: row.get("quarantined_at"),
            status: QuarantineStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for PostgresQuarantine {
    fn quarantine(
        &self,
        message: QuarantinedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            self.add_entry(&message).await?;
            Ok(())
        })
    }
}
