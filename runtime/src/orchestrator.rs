//! Orchestrator: one topic worker per event topic, one shutdown for all.
//!
//! Workers are registered per topic with the event type bound to it, so each
//! worker decodes and applies one statically-known type. Registration only
//! records how to build the worker; [`Orchestrator::start`] spawns them all.
//!
//! # Example
//!
//! ```ignore
//! let mut orchestrator = Orchestrator::new(WorkerConfig::from_env()?, Duration::from_secs(30))
//!     .with_dead_letters(Arc::new(quarantine));
//! orchestrator
//!     .register::<ViewEvent, _>(views_consumer, Arc::clone(&stats))?
//!     .register::<LikeEvent, _>(likes_consumer, Arc::clone(&stats))?;
//! orchestrator.start()?;
//!
//! tokio::signal::ctrl_c().await?;
//! let report = orchestrator.shutdown().await;
//! ```

use crate::config::WorkerConfig;
use crate::worker::{TopicWorker, WorkerHandle, WorkerState, WorkerSummary};
use outbox_relay_core::broker::BrokerConsumer;
use outbox_relay_core::event::TopicEvent;
use outbox_relay_core::sink::{DeadLetterSink, EventSink};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

/// Errors from orchestrator setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// A worker for this topic is already registered
    #[error("Topic '{0}' already has a worker")]
    DuplicateTopic(String),

    /// The consumer reads a different topic than the event type is bound to
    #[error("Consumer reads topic '{actual}' but the event type is bound to '{expected}'")]
    TopicMismatch {
        /// Topic of the event type
        expected: String,
        /// Topic of the consumer
        actual: String,
    },

    /// `start` was called with nothing registered
    #[error("No topic workers registered")]
    NothingRegistered,

    /// `start` was called twice
    #[error("Orchestrator already started")]
    AlreadyStarted,
}

type Spawner = Box<dyn FnOnce(watch::Receiver<bool>) -> WorkerHandle + Send>;

/// Outcome of [`Orchestrator::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that drained and closed, with their totals
    pub drained: Vec<(String, WorkerSummary)>,
    /// Workers still running at the deadline, aborted
    pub aborted: Vec<String>,
    /// Workers whose flush task panicked
    pub failed: Vec<String>,
}

impl ShutdownReport {
    /// `true` if every worker drained.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty() && self.failed.is_empty()
    }
}

/// Owns the topic workers of one consumer process.
pub struct Orchestrator {
    config: WorkerConfig,
    shutdown_timeout: Duration,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    registered: BTreeMap<String, Spawner>,
    running: Vec<WorkerHandle>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create an orchestrator whose workers share `config`.
    #[must_use]
    pub fn new(config: WorkerConfig, shutdown_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            shutdown_timeout,
            dead_letters: None,
            registered: BTreeMap::new(),
            running: Vec::new(),
            shutdown,
        }
    }

    /// Quarantine undecodable messages of every worker registered afterwards.
    #[must_use]
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Register the worker for `E`'s topic.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::DuplicateTopic`] if the topic already has a worker
    /// - [`OrchestratorError::TopicMismatch`] if `consumer` reads another topic
    /// - [`OrchestratorError::AlreadyStarted`] after [`start`](Self::start)
    pub fn register<E, S>(
        &mut self,
        consumer: Arc<dyn BrokerConsumer>,
        sink: Arc<S>,
    ) -> Result<&mut Self, OrchestratorError>
    where
        E: TopicEvent,
        S: EventSink<E>,
    {
        if !self.running.is_empty() {
            return Err(OrchestratorError::AlreadyStarted);
        }
        let topic = consumer.topic().to_string();
        if topic != E::TOPIC.as_str() {
            return Err(OrchestratorError::TopicMismatch {
                expected: E::TOPIC.as_str().to_string(),
                actual: topic,
            });
        }
        if self.registered.contains_key(&topic) {
            return Err(OrchestratorError::DuplicateTopic(topic));
        }

        let mut worker = TopicWorker::<E, S>::new(consumer, sink, self.config.clone());
        if let Some(dead_letters) = &self.dead_letters {
            worker = worker.with_dead_letters(Arc::clone(dead_letters));
        }
        self.registered
            .insert(topic, Box::new(move |shutdown: watch::Receiver<bool>| worker.spawn(shutdown)));
        Ok(self)
    }

    /// Topics with a registered worker, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        if self.running.is_empty() {
            self.registered.keys().cloned().collect()
        } else {
            self.running.iter().map(|w| w.topic().to_string()).collect()
        }
    }

    /// Spawn every registered worker.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NothingRegistered`] or
    /// [`OrchestratorError::AlreadyStarted`].
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        if !self.running.is_empty() {
            return Err(OrchestratorError::AlreadyStarted);
        }
        if self.registered.is_empty() {
            return Err(OrchestratorError::NothingRegistered);
        }
        for (topic, spawn) in std::mem::take(&mut self.registered) {
            tracing::debug!(topic = %topic, "Spawning topic worker");
            self.running.push(spawn(self.shutdown.subscribe()));
        }
        tracing::info!(workers = self.running.len(), "Orchestrator started");
        Ok(())
    }

    /// Current state of every running worker.
    #[must_use]
    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.running
            .iter()
            .map(|w| (w.topic().to_string(), w.state()))
            .collect()
    }

    /// Stop every fetch task and wait for each worker to flush its final batch.
    ///
    /// Waits at most `shutdown_timeout` in total; workers still running at the
    /// deadline (e.g. retrying against a sink that is down) are aborted. Their
    /// unflushed messages were never checkpointed and are redelivered.
    pub async fn shutdown(mut self) -> ShutdownReport {
        tracing::info!(workers = self.running.len(), "Shutting down topic workers");
        self.shutdown.send_replace(true);
        let deadline = Instant::now() + self.shutdown_timeout;

        let mut report = ShutdownReport::default();
        for mut worker in self.running.drain(..) {
            let topic = worker.topic().to_string();
            match timeout_at(deadline, worker.wait()).await {
                Ok(Ok(summary)) => report.drained.push((topic, summary)),
                Ok(Err(e)) => {
                    tracing::error!(topic = %topic, error = %e, "Topic worker failed");
                    report.failed.push(topic);
                }
                Err(_) => {
                    tracing::warn!(
                        topic = %topic,
                        state = ?worker.state(),
                        "Topic worker did not drain before the deadline, aborting"
                    );
                    worker.abort();
                    report.aborted.push(topic);
                }
            }
        }

        tracing::info!(
            drained = report.drained.len(),
            aborted = report.aborted.len(),
            failed = report.failed.len(),
            "Topic workers stopped"
        );
        report
    }
}
