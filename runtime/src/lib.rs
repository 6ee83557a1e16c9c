//! # Outbox Relay Runtime
//!
//! The moving parts of the pipeline, built on the trait seams of
//! `outbox-relay-core`.
//!
//! ## Core Components
//!
//! - **Relay Job**: tick-driven task draining the outbox into the broker
//! - **Topic Worker**: per-topic fetch task and flush task joined by a bounded buffer
//! - **Orchestrator**: one worker per topic, a single bounded shutdown
//!
//! ## Example
//!
//! ```ignore
//! use outbox_relay_runtime::{Orchestrator, RelayJob};
//!
//! // Producer side
//! let relay = RelayJob::new(outbox, producer, RelayConfig::from_env()?).spawn();
//!
//! // Consumer side
//! let mut orchestrator = Orchestrator::new(WorkerConfig::from_env()?, Duration::from_secs(30));
//! orchestrator.register::<ViewEvent, _>(consumer, sink)?;
//! orchestrator.start()?;
//! ```

/// Backoff between retries of transient failures
pub mod backoff;

/// Environment-driven configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Orchestrator owning the topic workers
pub mod orchestrator;

/// Outbox relay job
pub mod relay;

/// Per-topic fetch/flush pipeline
pub mod worker;

pub use backoff::BackoffPolicy;
pub use config::{ConfigError, RelayConfig, ServiceConfig, WorkerConfig};
pub use orchestrator::{Orchestrator, OrchestratorError, ShutdownReport};
pub use relay::{RelayHandle, RelayJob, TickOutcome};
pub use worker::{FlushReport, TopicWorker, WorkerHandle, WorkerState, WorkerSummary};
