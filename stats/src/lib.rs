//! Analytical sink for relayed events.
//!
//! Topic workers hand this crate batches of decoded events. Every event
//! becomes one row of `stats_events`, keyed by `(topic, event_id)`, which
//! makes applying a batch idempotent under at-least-once delivery.
//!
//! # Example
//!
//! ```ignore
//! use outbox_relay_stats::{PostgresStatsSink, migrate};
//!
//! let stats = PostgresStatsSink::new_with_separate_db("postgres://localhost/stats").await?;
//! migrate(stats.pool()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod fact;
mod sink;

pub use fact::{StatsEvent, StatsFact};
pub use sink::PostgresStatsSink;

use sqlx::PgPool;
use sqlx::migrate::MigrateError;

/// Apply the stats migrations.
///
/// # Errors
///
/// Returns [`MigrateError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    tracing::info!("Stats migrations applied");
    Ok(())
}
