//! Relay job: drains the outbox into the broker.
//!
//! # Overview
//!
//! One relay runs per producer process. Each tick:
//! 1. opens a relay transaction
//! 2. claims up to `batch_size` unprocessed rows, oldest first, skipping rows
//!    locked by other relays, and marks them processed (uncommitted)
//! 3. rolls back and returns if nothing was claimed
//! 4. publishes the whole batch, each row to the topic named by its `event_type`
//! 5. commits on publish success and advances the cursor, or rolls back on
//!    publish failure so the same rows are retried next tick
//!
//! Nothing here is fatal: publish failures are retried at the tick cadence,
//! database failures abandon the tick.
//!
//! # Cursor
//!
//! The cursor is the newest `created_at` of the last committed batch. It only
//! narrows the scan (`created_at >= cursor`); the `processed` flag decides
//! eligibility. A row committed late with an older `created_at` than the
//! cursor is picked up by the periodic full rescan, or after a restart.
//!
//! # Example
//!
//! ```ignore
//! let relay = RelayJob::new(PostgresOutbox::new(pool), Arc::new(producer), RelayConfig::from_env()?);
//! let handle = relay.spawn();
//!
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await; // waits for an in-flight tick to commit or roll back
//! ```

use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use outbox_relay_core::broker::{BrokerProducer, BrokerRecord};
use outbox_relay_core::checkpoint::RelayCursor;
use outbox_relay_core::outbox::{RelayStore, RelayTransaction};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Result of one relay tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No eligible rows
    Idle,
    /// `count` rows were published and committed as processed
    Relayed {
        /// Rows in the batch
        count: usize,
    },
    /// The broker rejected the batch; rows stay unprocessed
    PublishFailed,
    /// A database error ended the tick; rows stay unprocessed
    Abandoned,
}

impl TickOutcome {
    const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Relayed { .. } => "relayed",
            Self::PublishFailed => "publish_failed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Tick-driven outbox relay.
///
/// # Type Parameters
///
/// - `S`: The outbox the relay drains
pub struct RelayJob<S: RelayStore> {
    store: S,
    producer: Arc<dyn BrokerProducer>,
    config: RelayConfig,
    cursor: Option<RelayCursor>,
    ticks: u64,
}

impl<S: RelayStore> RelayJob<S> {
    /// Create a relay with an empty cursor.
    #[must_use]
    pub fn new(store: S, producer: Arc<dyn BrokerProducer>, config: RelayConfig) -> Self {
        Self {
            store,
            producer,
            config,
            cursor: None,
            ticks: 0,
        }
    }

    /// Current cursor, `None` until the first batch is committed.
    #[must_use]
    pub const fn cursor(&self) -> Option<RelayCursor> {
        self.cursor
    }

    /// Forget the cursor, as a process restart would.
    pub const fn reset_cursor(&mut self) {
        self.cursor = None;
    }

    /// Run one tick.
    ///
    /// Always runs to completion: the relay transaction is committed or
    /// rolled back before this returns.
    pub async fn tick(&mut self) -> TickOutcome {
        self.ticks += 1;
        let every = u64::from(self.config.full_rescan_every);
        let full_rescan = every > 0 && self.ticks % every == 0;
        let cursor = if full_rescan { None } else { self.cursor };

        let outcome = self.relay_batch(cursor).await;

        RelayMetrics::record_tick(outcome.label());
        match outcome {
            TickOutcome::Idle => tracing::trace!(full_rescan, "Relay tick idle"),
            TickOutcome::Relayed { count } => tracing::debug!(
                count,
                full_rescan,
                cursor = ?self.cursor.map(|c| c.created_at),
                "Relayed outbox batch"
            ),
            TickOutcome::PublishFailed | TickOutcome::Abandoned => {}
        }
        outcome
    }

    async fn relay_batch(&mut self, cursor: Option<RelayCursor>) -> TickOutcome {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(error = %e, "Relay tick abandoned: cannot open transaction");
                RelayMetrics::record_tick_error();
                return TickOutcome::Abandoned;
            }
        };

        let rows = match tx.claim_batch(cursor, self.config.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Relay tick abandoned: cannot claim outbox rows");
                RelayMetrics::record_tick_error();
                rollback(tx).await;
                return TickOutcome::Abandoned;
            }
        };

        if rows.is_empty() {
            rollback(tx).await;
            return TickOutcome::Idle;
        }

        let records: Vec<BrokerRecord> = rows.iter().map(BrokerRecord::from_outbox).collect();
        let started = Instant::now();
        if let Err(e) = self.producer.publish_batch(&records).await {
            tracing::warn!(
                error = %e,
                batch = rows.len(),
                first_id = %rows[0].id,
                "Publish failed, batch will be retried next tick"
            );
            RelayMetrics::record_publish_failure();
            rollback(tx).await;
            return TickOutcome::PublishFailed;
        }
        let publish_duration = started.elapsed();

        if let Err(e) = tx.commit().await {
            // Published but not marked: the rows are republished next tick.
            tracing::warn!(
                error = %e,
                batch = rows.len(),
                "Commit failed after publish, batch will be republished"
            );
            RelayMetrics::record_tick_error();
            return TickOutcome::Abandoned;
        }

        RelayMetrics::record_published(rows.len(), publish_duration);
        self.cursor = RelayCursor::advance(self.cursor, RelayCursor::after_batch(&rows));
        TickOutcome::Relayed { count: rows.len() }
    }
}

async fn rollback<T: RelayTransaction>(tx: T) {
    if let Err(e) = tx.rollback().await {
        // Locks are released when the connection drops the transaction anyway.
        tracing::warn!(error = %e, "Relay rollback failed");
    }
}

impl<S> RelayJob<S>
where
    S: RelayStore + 'static,
{
    /// Run the relay on its own task, ticking every `interval`.
    ///
    /// The first tick fires immediately. Ticks never overlap: a slow tick
    /// delays the next one. Dropping the returned handle stops the relay
    /// the same way [`RelayHandle::stop`] does, without waiting.
    #[must_use]
    pub fn spawn(mut self) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
                batch_size = self.config.batch_size,
                "Relay started"
            );

            while !*shutdown_rx.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Not raced against shutdown: an in-flight tick finishes.
                        self.tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Relay handle dropped");
                            break;
                        }
                    }
                }
            }

            tracing::info!("Relay stopped");
        });

        RelayHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop ticking and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        self.shutdown.send(true).ok();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Relay task failed");
        }
    }

    /// `true` once the relay task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
