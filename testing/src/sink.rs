//! In-memory sink and dead-letter store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use outbox_relay_core::event::TopicEvent;
use outbox_relay_core::outbox::OutboxId;
use outbox_relay_core::sink::{DeadLetterSink, Envelope, EventSink, QuarantinedMessage, SinkError};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct SinkState<E> {
    events: Vec<Envelope<E>>,
    seen: HashSet<OutboxId>,
    batch_sizes: Vec<usize>,
    attempts: usize,
    duplicates: usize,
    fail_next: u32,
    available: bool,
}

/// Deduplicating in-memory sink for one event type.
///
/// Applies are idempotent on `event_id`, like the Postgres stats sink.
/// Cloning shares the recorded events.
///
/// # Example
///
/// ```
/// use outbox_relay_testing::InMemorySink;
/// use outbox_relay_core::event::ViewEvent;
///
/// let sink = InMemorySink::<ViewEvent>::new();
/// sink.set_available(false); // every apply fails until re-enabled
/// assert_eq!(sink.len(), 0);
/// ```
#[derive(Debug)]
pub struct InMemorySink<E> {
    state: Arc<Mutex<SinkState<E>>>,
}

impl<E> Clone for InMemorySink<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: TopicEvent> InMemorySink<E> {
    /// Create an empty, available sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                events: Vec::new(),
                seen: HashSet::new(),
                batch_sizes: Vec::new(),
                attempts: 0,
                duplicates: 0,
                fail_next: 0,
                available: true,
            })),
        }
    }

    /// Make the next `n` applies fail.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Take the sink down (`false`) or bring it back (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    /// Distinct events applied, in application order.
    #[must_use]
    pub fn events(&self) -> Vec<Envelope<E>> {
        self.state.lock().unwrap().events.clone()
    }

    /// Number of distinct events applied.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    /// `true` if nothing has been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of every successful apply, in order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batch_sizes.clone()
    }

    /// Number of `apply` calls, failed ones included.
    #[must_use]
    pub fn apply_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    /// Number of events received again after already being applied.
    #[must_use]
    pub fn duplicates(&self) -> usize {
        self.state.lock().unwrap().duplicates
    }
}

impl<E: TopicEvent> Default for InMemorySink<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TopicEvent> EventSink<E> for InMemorySink<E> {
    async fn apply(&self, batch: &[Envelope<E>]) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if !state.available {
            return Err(SinkError::Unavailable("sink is down".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SinkError::Storage("injected apply failure".to_string()));
        }
        for envelope in batch {
            if state.seen.insert(envelope.event_id) {
                state.events.push(envelope.clone());
            } else {
                state.duplicates += 1;
            }
        }
        state.batch_sizes.push(batch.len());
        Ok(())
    }
}

/// In-memory [`DeadLetterSink`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetters {
    messages: Arc<Mutex<Vec<QuarantinedMessage>>>,
    fail_next: Arc<Mutex<u32>>,
}

impl InMemoryDeadLetters {
    /// Create an empty quarantine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` quarantines fail.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }

    /// Quarantined messages, in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<QuarantinedMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn quarantine(
        &self,
        message: QuarantinedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(SinkError::Unavailable("injected quarantine failure".to_string()));
            }
            drop(fail_next);
            self.messages.lock().unwrap().push(message);
            Ok(())
        })
    }
}
