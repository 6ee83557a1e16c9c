//! In-memory outbox.
//!
//! Mirrors the Postgres outbox closely enough to exercise relay semantics:
//! - write transactions buffer rows until committed; dropping one discards them
//! - ids are allocated at insert time, like a sequence, even if the write rolls back
//! - relay transactions lock the rows they claim; concurrent claims skip locked rows
//! - claimed rows become processed only when the relay transaction commits;
//!   dropping or rolling back releases them untouched

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use crate::mocks::stepping_clock;
use outbox_relay_core::checkpoint::RelayCursor;
use outbox_relay_core::environment::Clock;
use outbox_relay_core::event::TopicEvent;
use outbox_relay_core::outbox::{
    NewOutboxEvent, OutboxError, OutboxEvent, OutboxId, OutboxWriter, RelayStore, RelayTransaction,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct OutboxState {
    rows: BTreeMap<OutboxId, OutboxEvent>,
    locked: HashSet<OutboxId>,
    next_id: i64,
    fail_begins: u32,
    fail_commits: u32,
    claims: usize,
}

impl OutboxState {
    fn release(&mut self, ids: &[OutboxId]) {
        for id in ids {
            self.locked.remove(id);
        }
    }
}

/// In-memory outbox implementing both [`OutboxWriter`] and [`RelayStore`].
///
/// Cloning shares the underlying table.
///
/// # Example
///
/// ```
/// use outbox_relay_testing::InMemoryOutbox;
/// use outbox_relay_core::event::RegistrationEvent;
/// use chrono::Utc;
///
/// let outbox = InMemoryOutbox::new();
/// outbox.seed(&[RegistrationEvent { profile_id: 1, registered_at: Utc::now() }]);
/// assert_eq!(outbox.unprocessed_count(), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutbox {
    /// Create an empty outbox whose rows get strictly increasing timestamps.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(stepping_clock()))
    }

    /// Create an empty outbox stamping `created_at` from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutboxState {
                next_id: 1,
                ..OutboxState::default()
            })),
            clock,
        }
    }

    /// Open a business write transaction.
    #[must_use]
    pub fn begin_write(&self) -> InMemoryWriteTransaction {
        InMemoryWriteTransaction {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }
    }

    /// Record each event in its own committed write transaction.
    ///
    /// Returns the allocated ids in order.
    pub fn seed<E: TopicEvent>(&self, events: &[E]) -> Vec<OutboxId> {
        events
            .iter()
            .map(|event| {
                let mut tx = self.begin_write();
                let id = self.insert(&mut tx, NewOutboxEvent::from_event(event).unwrap());
                tx.commit();
                id
            })
            .collect()
    }

    /// Make the next `n` calls to [`RelayStore::begin`] fail.
    pub fn fail_next_begins(&self, n: u32) {
        self.state.lock().unwrap().fail_begins = n;
    }

    /// Make the next `n` relay commits fail (rows stay unprocessed).
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().unwrap().fail_commits = n;
    }

    /// Snapshot of every committed row, ordered by id.
    #[must_use]
    pub fn rows(&self) -> Vec<OutboxEvent> {
        self.state.lock().unwrap().rows.values().cloned().collect()
    }

    /// Number of committed rows not yet processed.
    #[must_use]
    pub fn unprocessed_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|row| !row.processed)
            .count()
    }

    /// Number of rows currently locked by an open relay transaction.
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.state.lock().unwrap().locked.len()
    }

    /// Number of `claim_batch` calls served.
    #[must_use]
    pub fn claim_count(&self) -> usize {
        self.state.lock().unwrap().claims
    }

    fn insert(&self, tx: &mut InMemoryWriteTransaction, event: NewOutboxEvent) -> OutboxId {
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = OutboxId(state.next_id);
            state.next_id += 1;
            id
        };
        tx.pending.push(OutboxEvent {
            id,
            event_type: event.event_type,
            payload: event.payload,
            created_at: self.clock.now(),
            processed: false,
        });
        id
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Business transaction of the in-memory outbox.
///
/// Rows become visible on [`commit`](Self::commit); dropping discards them.
pub struct InMemoryWriteTransaction {
    state: Arc<Mutex<OutboxState>>,
    pending: Vec<OutboxEvent>,
}

impl InMemoryWriteTransaction {
    /// Publish the buffered rows to the table.
    pub fn commit(mut self) {
        let mut state = self.state.lock().unwrap();
        for row in self.pending.drain(..) {
            state.rows.insert(row.id, row);
        }
    }
}

impl OutboxWriter for InMemoryOutbox {
    type Transaction = InMemoryWriteTransaction;

    async fn put(
        &self,
        tx: &mut InMemoryWriteTransaction,
        event: NewOutboxEvent,
    ) -> Result<OutboxId, OutboxError> {
        Ok(self.insert(tx, event))
    }
}

impl RelayStore for InMemoryOutbox {
    type Transaction = InMemoryRelayTransaction;

    async fn begin(&self) -> Result<InMemoryRelayTransaction, OutboxError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_begins > 0 {
            state.fail_begins -= 1;
            return Err(OutboxError::Begin("injected begin failure".to_string()));
        }
        Ok(InMemoryRelayTransaction {
            state: Arc::clone(&self.state),
            claimed: Vec::new(),
        })
    }
}

/// Relay transaction of the in-memory outbox.
///
/// Holds the row locks of its claims until commit, rollback or drop.
pub struct InMemoryRelayTransaction {
    state: Arc<Mutex<OutboxState>>,
    claimed: Vec<OutboxId>,
}

impl RelayTransaction for InMemoryRelayTransaction {
    async fn claim_batch(
        &mut self,
        cursor: Option<RelayCursor>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let mut state = self.state.lock().unwrap();
        state.claims += 1;

        let mut eligible: Vec<&OutboxEvent> = state
            .rows
            .values()
            .filter(|row| !row.processed && !state.locked.contains(&row.id))
            .filter(|row| cursor.is_none_or(|c| row.created_at >= c.created_at))
            .collect();
        eligible.sort_by_key(|row| (row.created_at, row.id));

        let batch: Vec<OutboxEvent> = eligible
            .into_iter()
            .take(limit)
            .map(|row| OutboxEvent {
                processed: true,
                ..row.clone()
            })
            .collect();

        for row in &batch {
            state.locked.insert(row.id);
            self.claimed.push(row.id);
        }
        Ok(batch)
    }

    async fn commit(mut self) -> Result<(), OutboxError> {
        let claimed = std::mem::take(&mut self.claimed);
        let mut state = self.state.lock().unwrap();
        state.release(&claimed);
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(OutboxError::Database("injected commit failure".to_string()));
        }
        for id in &claimed {
            if let Some(row) = state.rows.get_mut(id) {
                row.processed = true;
            }
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), OutboxError> {
        let claimed = std::mem::take(&mut self.claimed);
        self.state.lock().unwrap().release(&claimed);
        Ok(())
    }
}

impl Drop for InMemoryRelayTransaction {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.release(&self.claimed);
        }
    }
}
