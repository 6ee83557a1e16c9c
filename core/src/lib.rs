//! # Outbox Relay Core
//!
//! Core types and trait seams shared by the producer side (outbox writer and
//! relay job) and the consumer side (topic workers and sinks).
//!
//! ## Core Concepts
//!
//! - **Event**: a statically-typed domain event bound to exactly one topic
//! - **Outbox**: rows written in the business transaction, drained by the relay
//! - **Broker**: the partitioned log between relay and consumers
//! - **Checkpoint**: per-partition consumer position, committed after apply
//! - **Sink**: the idempotent analytical store a topic worker writes to
//!
//! ## Architecture Principles
//!
//! - Correctness rests on durable state only (the `processed` flag and broker
//!   checkpoints); in-memory cursors narrow scans and nothing more
//! - At-least-once end to end; every consumer tolerates duplicates
//! - Infrastructure behind traits so tests run on in-memory collaborators
//!
//! ## Example
//!
//! ```ignore
//! use outbox_relay_core::event::ViewEvent;
//! use outbox_relay_core::outbox::OutboxWriter;
//!
//! let mut tx = pool.begin().await?;
//! record_view_in_posts_table(&mut tx, post_id, viewer_id).await?;
//! outbox.record(&mut tx, &ViewEvent { post_id, viewer_id, author_id, viewed_at }).await?;
//! tx.commit().await?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod broker;
pub mod checkpoint;
pub mod event;
pub mod outbox;
pub mod sink;

/// Environment module - injected dependencies
///
/// External time is abstracted behind a trait so in-memory collaborators can
/// stamp rows deterministically in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use outbox_relay_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
