//! Topic worker: fetch, batch, flush, checkpoint.
//!
//! # Overview
//!
//! One worker runs per topic, as two tasks joined by a bounded FIFO buffer:
//!
//! ```text
//! ┌────────┐  fetch   ┌────────────┐  bounded mpsc  ┌────────────┐  apply   ┌──────┐
//! │ Broker │ ───────► │ fetch task │ ─────────────► │ flush task │ ───────► │ Sink │
//! └────────┘          └────────────┘  (capacity B)  └─────┬──────┘          └──────┘
//!     ▲                                                   │
//!     └────────────────────── commit(checkpoint) ─────────┘
//! ```
//!
//! - **Fetch task**: waits for the next message, decodes it, pushes it onto the
//!   buffer. A full buffer blocks it, which throttles consumption to the sink's
//!   pace; the broker keeps what has not been fetched. Fetch errors are retried
//!   with backoff. End of stream closes the buffer.
//! - **Flush task**: accumulates up to `batch_capacity` messages. A full batch
//!   flushes at once; otherwise the flush interval flushes whatever is there.
//!
//! # Flush
//!
//! 1. Apply the batch to the sink, retrying with backoff until it succeeds.
//!    The checkpoint does not move while this fails.
//! 2. Commit the checkpoint covering every message of the batch, retrying
//!    with backoff. Only the commit is retried: the batch is marked applied
//!    and is never handed to the sink twice by this process.
//!
//! A crash between 1 and 2 redelivers the batch after restart; sinks
//! deduplicate on `(topic, event_id)`.
//!
//! # Undecodable messages
//!
//! A payload that does not decode, or a record whose outbox headers could
//! not be read, is logged and handed to the dead-letter sink if one is
//! configured. It enters the batch as a skipped entry: it takes a slot and is
//! covered by the checkpoint, but never reaches the sink.
//!
//! # States
//!
//! `Filling → Flushing → Filling` on success; `Flushing` persists across
//! retries; upstream close moves to `Draining`, and to `Closed` after the
//! final flush.

use crate::backoff::{BackoffPolicy, retry_until_ok};
use crate::config::WorkerConfig;
use crate::metrics::WorkerMetrics;
use outbox_relay_core::broker::{BrokerConsumer, BrokerError, CommitHandle, ConsumerRecord};
use outbox_relay_core::checkpoint::Checkpoint;
use outbox_relay_core::event::TopicEvent;
use outbox_relay_core::sink::{DeadLetterSink, Envelope, EventSink, QuarantinedMessage, SinkError};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep, sleep_until};

/// Lifecycle state of a topic worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accumulating messages
    Filling,
    /// Applying a batch or committing its checkpoint (including retries)
    Flushing,
    /// Upstream closed; flushing what is left
    Draining,
    /// Terminal
    Closed,
}

/// What one flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Events applied to the sink
    pub events: usize,
    /// Undecodable messages checkpointed without applying
    pub skipped: usize,
    /// `apply` calls made (0 if the batch held only skipped messages)
    pub apply_attempts: usize,
    /// `commit` calls made
    pub commit_attempts: usize,
}

/// Totals over a worker's lifetime, returned when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Completed flushes
    pub flushes: usize,
    /// Events applied
    pub events: usize,
    /// Messages skipped as undecodable
    pub skipped: usize,
}

/// Hand-off item from the fetch task to the flush task.
enum Fetched<E> {
    Event {
        handle: CommitHandle,
        envelope: Envelope<E>,
    },
    Skipped {
        handle: CommitHandle,
    },
}

/// In-memory batch owned by the flush task.
struct Batch<E> {
    envelopes: Vec<Envelope<E>>,
    handles: Vec<CommitHandle>,
    skipped: usize,
    capacity: usize,
    /// Set once the sink accepted this batch; guards against a second apply
    /// while only the commit is being retried.
    applied: bool,
}

impl<E> Batch<E> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            envelopes: Vec::with_capacity(capacity),
            handles: Vec::with_capacity(capacity),
            skipped: 0,
            capacity,
            applied: false,
        }
    }

    fn push(&mut self, fetched: Fetched<E>) {
        match fetched {
            Fetched::Event { handle, envelope } => {
                self.handles.push(handle);
                self.envelopes.push(envelope);
            }
            Fetched::Skipped { handle } => {
                self.handles.push(handle);
                self.skipped += 1;
            }
        }
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn clear(&mut self) {
        self.envelopes.clear();
        self.handles.clear();
        self.skipped = 0;
        self.applied = false;
    }
}

/// A topic worker, ready to spawn.
///
/// # Type Parameters
///
/// - `E`: The event type bound to the consumed topic
/// - `S`: The sink the batches are applied to
pub struct TopicWorker<E, S> {
    consumer: Arc<dyn BrokerConsumer>,
    sink: Arc<S>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    config: WorkerConfig,
    _event: PhantomData<fn() -> E>,
}

impl<E, S> TopicWorker<E, S>
where
    E: TopicEvent,
    S: EventSink<E>,
{
    /// Create a worker for `consumer`'s topic.
    #[must_use]
    pub fn new(consumer: Arc<dyn BrokerConsumer>, sink: Arc<S>, config: WorkerConfig) -> Self {
        Self {
            consumer,
            sink,
            dead_letters: None,
            config,
            _event: PhantomData,
        }
    }

    /// Quarantine undecodable messages in `dead_letters`.
    #[must_use]
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Start the fetch and flush tasks.
    ///
    /// Sending `true` on `shutdown` stops the fetch task; the flush task then
    /// drains the buffer, flushes the final batch and exits.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        let topic = self.consumer.topic().to_string();
        let (buffer_tx, buffer_rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(WorkerState::Filling);

        tracing::info!(
            topic = %topic,
            group = %self.consumer.group(),
            batch_capacity = self.config.batch_capacity,
            buffer_capacity = self.config.buffer_capacity,
            "Starting topic worker"
        );

        let fetch = tokio::spawn(fetch_loop::<E>(
            Arc::clone(&self.consumer),
            self.dead_letters,
            buffer_tx,
            shutdown,
            self.config.backoff.clone(),
        ));
        let flush = tokio::spawn(flush_loop(
            self.consumer,
            self.sink,
            buffer_rx,
            self.config,
            state_tx,
        ));

        WorkerHandle {
            topic,
            state: state_rx,
            fetch,
            flush,
        }
    }
}

/// Handle to a running topic worker.
pub struct WorkerHandle {
    topic: String,
    state: watch::Receiver<WorkerState>,
    fetch: JoinHandle<()>,
    flush: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    /// The topic this worker consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver for state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Wait for both tasks to finish and return the flush totals.
    ///
    /// # Errors
    ///
    /// Returns the [`JoinError`] of the flush task if it panicked or was aborted.
    pub async fn wait(&mut self) -> Result<WorkerSummary, JoinError> {
        if let Err(e) = (&mut self.fetch).await {
            if !e.is_cancelled() {
                tracing::error!(topic = %self.topic, error = %e, "Fetch task failed");
            }
        }
        (&mut self.flush).await
    }

    /// Abort both tasks. Unflushed messages are redelivered by the broker.
    pub fn abort(&self) {
        self.fetch.abort();
        self.flush.abort();
    }
}

async fn fetch_loop<E: TopicEvent>(
    consumer: Arc<dyn BrokerConsumer>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    buffer: mpsc::Sender<Fetched<E>>,
    mut shutdown: watch::Receiver<bool>,
    backoff: BackoffPolicy,
) {
    let topic = consumer.topic().to_string();
    let mut failures = 0usize;

    while !*shutdown.borrow() {
        let next = tokio::select! {
            next = consumer.fetch() => next,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        let record = match next {
            None => {
                tracing::info!(topic = %topic, "Upstream closed");
                break;
            }
            Some(Err(e)) => {
                failures += 1;
                WorkerMetrics::record_fetch_error(&topic);
                let delay = backoff.delay_for_attempt(failures - 1);
                tracing::warn!(
                    topic = %topic,
                    error = %e,
                    transient = e.is_transient(),
                    attempt = failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Fetch failed, backing off"
                );
                tokio::select! {
                    () = sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            Some(Ok(record)) => record,
        };

        failures = 0;
        WorkerMetrics::record_fetch(&topic);
        let fetched = decode::<E>(record, consumer.as_ref(), dead_letters.as_deref()).await;

        // Blocks while the buffer is full.
        tokio::select! {
            sent = buffer.send(fetched) => {
                if sent.is_err() {
                    tracing::warn!(topic = %topic, "Flush task gone, stopping fetch");
                    break;
                }
            }
            changed = shutdown.changed() => {
                // The unsent message is not checkpointed and will be redelivered.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!(topic = %topic, "Fetch task stopped");
}

async fn decode<E: TopicEvent>(
    record: ConsumerRecord,
    consumer: &dyn BrokerConsumer,
    dead_letters: Option<&dyn DeadLetterSink>,
) -> Fetched<E> {
    let handle = record.handle;
    let (event_id, error) = match record.malformed {
        Some(reason) => (None, reason),
        None => match E::decode(&record.payload) {
            Ok(event) => {
                return Fetched::Event {
                    handle,
                    envelope: Envelope {
                        event_id: record.event_id,
                        created_at: record.created_at,
                        event,
                    },
                };
            }
            Err(e) => (Some(record.event_id), e.to_string()),
        },
    };

    tracing::warn!(
        topic = %consumer.topic(),
        partition = handle.partition,
        offset = handle.offset,
        event_id = ?event_id,
        error = %error,
        "Skipping undecodable message"
    );
    WorkerMetrics::record_quarantined(consumer.topic());
    if let Some(dead_letters) = dead_letters {
        let message = QuarantinedMessage {
            topic: consumer.topic().to_string(),
            group: consumer.group().to_string(),
            handle,
            event_id,
            payload: record.payload,
            error,
        };
        if let Err(qe) = dead_letters.quarantine(message).await {
            tracing::error!(
                topic = %consumer.topic(),
                offset = handle.offset,
                error = %qe,
                "Failed to quarantine message, skipping it anyway"
            );
        }
    }
    Fetched::Skipped { handle }
}

async fn flush_loop<E, S>(
    consumer: Arc<dyn BrokerConsumer>,
    sink: Arc<S>,
    mut buffer: mpsc::Receiver<Fetched<E>>,
    config: WorkerConfig,
    state: watch::Sender<WorkerState>,
) -> WorkerSummary
where
    E: TopicEvent,
    S: EventSink<E>,
{
    let mut batch = Batch::new(config.batch_capacity);
    let mut summary = WorkerSummary::default();
    let deadline = sleep_until(Instant::now() + config.flush_interval);
    tokio::pin!(deadline);

    loop {
        if batch.is_full() {
            let report = flush(&mut batch, consumer.as_ref(), sink.as_ref(), &config.backoff, &state).await;
            summary.record(report);
            deadline.as_mut().reset(Instant::now() + config.flush_interval);
            continue;
        }

        tokio::select! {
            received = buffer.recv() => match received {
                Some(fetched) => batch.push(fetched),
                None => break,
            },
            () = &mut deadline => {
                if !batch.is_empty() {
                    let report = flush(&mut batch, consumer.as_ref(), sink.as_ref(), &config.backoff, &state).await;
                    summary.record(report);
                }
                deadline.as_mut().reset(Instant::now() + config.flush_interval);
            }
        }
    }

    state.send_replace(WorkerState::Draining);
    if !batch.is_empty() {
        let report = flush(&mut batch, consumer.as_ref(), sink.as_ref(), &config.backoff, &state).await;
        summary.record(report);
        state.send_replace(WorkerState::Draining);
    }
    state.send_replace(WorkerState::Closed);

    tracing::info!(
        topic = %consumer.topic(),
        flushes = summary.flushes,
        events = summary.events,
        skipped = summary.skipped,
        "Topic worker closed"
    );
    summary
}

impl WorkerSummary {
    const fn record(&mut self, report: FlushReport) {
        self.flushes += 1;
        self.events += report.events;
        self.skipped += report.skipped;
    }
}

async fn flush<E, S>(
    batch: &mut Batch<E>,
    consumer: &dyn BrokerConsumer,
    sink: &S,
    backoff: &BackoffPolicy,
    state: &watch::Sender<WorkerState>,
) -> FlushReport
where
    E: TopicEvent,
    S: EventSink<E>,
{
    state.send_replace(WorkerState::Flushing);
    let topic = consumer.topic();
    let started = Instant::now();

    let mut apply_attempts = 0;
    if !batch.applied {
        if !batch.envelopes.is_empty() {
            let ((), attempts) = retry_until_ok(
                backoff,
                || sink.apply(&batch.envelopes),
                |e: &SinkError, attempt| {
                    WorkerMetrics::record_sink_failure(topic);
                    tracing::warn!(
                        topic = %topic,
                        batch = batch.envelopes.len(),
                        attempt,
                        error = %e,
                        "Sink apply failed, retrying batch"
                    );
                },
            )
            .await;
            apply_attempts = attempts;
        }
        batch.applied = true;
    }

    let checkpoint = Checkpoint::covering(&batch.handles);
    let ((), commit_attempts) = retry_until_ok(
        backoff,
        || consumer.commit(&checkpoint),
        |e: &BrokerError, attempt| {
            WorkerMetrics::record_commit_failure(topic);
            tracing::warn!(
                topic = %topic,
                group = %consumer.group(),
                attempt,
                error = %e,
                "Checkpoint commit failed, retrying commit only"
            );
        },
    )
    .await;

    let report = FlushReport {
        events: batch.envelopes.len(),
        skipped: batch.skipped,
        apply_attempts,
        commit_attempts,
    };
    WorkerMetrics::record_flush(topic, started.elapsed());
    tracing::debug!(
        topic = %topic,
        events = report.events,
        skipped = report.skipped,
        apply_attempts = report.apply_attempts,
        commit_attempts = report.commit_attempts,
        checkpoint = ?checkpoint,
        "Flushed batch"
    );

    batch.clear();
    state.send_replace(WorkerState::Filling);
    report
}
