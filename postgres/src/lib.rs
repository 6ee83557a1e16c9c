//! `PostgreSQL` storage for the outbox relay.
//!
//! This crate provides:
//!
//! - [`PostgresOutbox`]: the outbox writer used inside business transactions,
//!   and the relay store that claims batches with `FOR UPDATE SKIP LOCKED`
//! - [`PostgresQuarantine`]: the dead-letter table for undecodable messages
//! - [`migrate`]: the schema for both
//!
//! # Example
//!
//! ```ignore
//! use outbox_relay_postgres::{PostgresOutbox, migrate};
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/posts").await?;
//! migrate(&pool).await?;
//! let outbox = PostgresOutbox::new(pool);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox;
mod quarantine;

pub use outbox::{PostgresOutbox, PostgresRelayTransaction};
pub use quarantine::{PostgresQuarantine, QuarantineEntry, QuarantineStatus};

use sqlx::PgPool;
use sqlx::migrate::MigrateError;

/// Apply the outbox and quarantine migrations.
///
/// Other crates keep their own migrations in the same database, so versions
/// applied by them are ignored here.
///
/// # Errors
///
/// Returns [`MigrateError`] if a migration fails or was modified after being applied.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    tracing::info!("Outbox migrations applied");
    Ok(())
}
