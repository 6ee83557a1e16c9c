//! Redpanda transport for the outbox relay.
//!
//! This crate implements the broker seams from `outbox-relay-core` with
//! rdkafka, so it works against Redpanda or any Kafka-compatible cluster.
//!
//! - [`RedpandaProducer`]: the relay's [`BrokerProducer`]. Waits for every
//!   in-sync replica (`acks=all`) and fails the whole batch if any record
//!   fails.
//! - [`RedpandaConsumer`]: one topic, one consumer group, offsets committed
//!   only when a topic worker hands it a [`Checkpoint`].
//!
//! # Wire format
//!
//! ```text
//! key      = topic name (one partition order per topic)
//! payload  = bincode-encoded catalog event
//! headers  = event-id   : outbox id, decimal
//!            created-at : outbox created_at, RFC 3339
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once**: auto-commit is disabled. A message is committed only
//! after the batch holding it was applied to the sink. A crash before that
//! redelivers it, so sinks deduplicate on the `event-id` header.
//!
//! Commits are synchronous: `commit` resolves with the broker's answer, so a
//! rejected commit reaches the worker's retry loop instead of being lost.
//!
//! # Example
//!
//! ```no_run
//! use outbox_relay_redpanda::{RedpandaConsumer, RedpandaProducer};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let producer = RedpandaProducer::new("localhost:9092")?;
//!
//! let views = RedpandaConsumer::builder()
//!     .brokers("localhost:9092")
//!     .topic("view")
//!     .group("stats-ingest-view")
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`BrokerProducer`]: outbox_relay_core::broker::BrokerProducer
//! [`Checkpoint`]: outbox_relay_core::checkpoint::Checkpoint

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;
mod headers;
mod producer;

pub use consumer::{RedpandaConsumer, RedpandaConsumerBuilder};
pub use headers::{CREATED_AT_HEADER, EVENT_ID_HEADER};
pub use producer::{RedpandaProducer, RedpandaProducerBuilder};
