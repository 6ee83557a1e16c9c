//! # Outbox Relay Testing
//!
//! In-memory collaborators for testing the relay job, topic workers and the
//! orchestrator without Postgres or a broker.
//!
//! This crate provides:
//! - [`InMemoryOutbox`]: outbox writer and relay store with skip-locked claims
//! - [`InMemoryBroker`]: single-partition topics, consumer groups, committed offsets
//! - [`InMemorySink`] / [`InMemoryDeadLetters`]: deduplicating sink and quarantine
//! - Deterministic clocks
//!
//! Every collaborator supports failure injection (`fail_next_*`) so tests can
//! drive the retry paths.
//!
//! ## Example
//!
//! ```ignore
//! use outbox_relay_testing::{InMemoryBroker, InMemoryOutbox};
//!
//! #[tokio::test]
//! async fn relays_committed_rows() {
//!     let outbox = InMemoryOutbox::new();
//!     let broker = InMemoryBroker::new();
//!     outbox.seed(&views(3));
//!
//!     let mut relay = RelayJob::new(outbox.clone(), Arc::new(broker.clone()), RelayConfig::default());
//!     relay.tick().await;
//!
//!     assert_eq!(broker.message_count("view"), 3);
//! }
//! ```

pub mod broker;
pub mod outbox;
pub mod sink;

use chrono::{DateTime, Utc};
use outbox_relay_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_relay_testing::mocks::FixedClock;
    /// use outbox_relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that moves forward by a fixed step on every reading.
    ///
    /// Gives outbox rows distinct, strictly increasing `created_at` values.
    #[derive(Debug)]
    pub struct SteppingClock {
        next: Mutex<DateTime<Utc>>,
        step: chrono::Duration,
    }

    impl SteppingClock {
        /// Start at `start`, advancing by `step` per reading.
        #[must_use]
        pub const fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
            Self {
                next: Mutex::new(start),
                step,
            }
        }
    }

    impl Clock for SteppingClock {
        #[allow(clippy::unwrap_used)] // Poisoned only if a test already panicked
        fn now(&self) -> DateTime<Utc> {
            let mut next = self.next.lock().unwrap();
            let now = *next;
            *next = now + self.step;
            now
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Stepping clock starting at the [`test_clock`] time, one millisecond per reading.
    #[must_use]
    pub fn stepping_clock() -> SteppingClock {
        SteppingClock::new(test_clock().now(), chrono::Duration::milliseconds(1))
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemoryConsumer};
pub use mocks::{FixedClock, SteppingClock, stepping_clock, test_clock};
pub use outbox::{InMemoryOutbox, InMemoryRelayTransaction, InMemoryWriteTransaction};
pub use sink::{InMemoryDeadLetters, InMemorySink};
