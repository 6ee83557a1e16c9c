//! Position bookkeeping on both sides of the broker.
//!
//! - [`RelayCursor`]: process-local, in-memory, advisory. It only narrows the
//!   relay's outbox scan. Losing it (restart) costs a wider scan, never a lost
//!   or duplicated row, because eligibility is decided by the durable
//!   `processed` flag.
//! - [`Checkpoint`]: the broker-tracked consumer position per partition. It is
//!   derived from the commit handles of a batch and committed only after the
//!   batch has been applied to the sink.

use crate::broker::CommitHandle;
use crate::outbox::OutboxEvent;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Advisory scan lower bound for the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RelayCursor {
    /// `created_at` of the newest row of the last committed batch
    pub created_at: DateTime<Utc>,
}

impl RelayCursor {
    /// Cursor after a committed batch: the batch's maximum `created_at`.
    ///
    /// Returns `None` for an empty batch.
    #[must_use]
    pub fn after_batch(batch: &[OutboxEvent]) -> Option<Self> {
        batch
            .iter()
            .map(|row| row.created_at)
            .max()
            .map(|created_at| Self { created_at })
    }

    /// Advance to `next` unless that would move the cursor backwards.
    #[must_use]
    pub fn advance(current: Option<Self>, next: Option<Self>) -> Option<Self> {
        match (current, next) {
            (Some(current), Some(next)) => Some(current.max(next)),
            (current, next) => next.or(current),
        }
    }
}

/// Next offset to consume, per partition, for one (topic, consumer group).
///
/// Committing a checkpoint tells the broker every message before these offsets
/// has been durably handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    next_offsets: BTreeMap<i32, i64>,
}

impl Checkpoint {
    /// Empty checkpoint (covers nothing).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the checkpoint covering every handle in `handles`.
    #[must_use]
    pub fn covering<'a>(handles: impl IntoIterator<Item = &'a CommitHandle>) -> Self {
        let mut checkpoint = Self::new();
        for handle in handles {
            checkpoint.include(*handle);
        }
        checkpoint
    }

    /// Extend the checkpoint to cover `handle`. Never moves a partition backwards.
    pub fn include(&mut self, handle: CommitHandle) {
        let next = handle.offset.saturating_add(1);
        self.next_offsets
            .entry(handle.partition)
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }

    /// Next offset to consume on `partition`, if covered.
    #[must_use]
    pub fn next_offset(&self, partition: i32) -> Option<i64> {
        self.next_offsets.get(&partition).copied()
    }

    /// Iterate `(partition, next_offset)` pairs in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.next_offsets.iter().map(|(p, o)| (*p, *o))
    }

    /// `true` if the checkpoint covers no partition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next_offsets.is_empty()
    }
}
