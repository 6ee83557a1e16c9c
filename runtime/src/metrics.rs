//! Prometheus metrics for the relay job and the topic workers.
//!
//! This module provides metric collection for both sides of the pipeline:
//! - Relay ticks, published events, publish failures
//! - Worker fetches, flushes, sink and commit failures, quarantined messages
//!
//! Worker metrics carry a `topic` label.
//!
//! # Example
//!
//! ```rust,no_run
//! use outbox_relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime; the HTTP listener runs as a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built (e.g. the address cannot
    /// be bound).
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning
    /// and succeeds without a handle. In production, call this once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                // Register all metric descriptions against the installed recorder
                register_metrics();
                tokio::spawn(async move {
                    if let Err(e) = exporter.await {
                        tracing::error!(error = ?e, "Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(_already_installed) => {
                // In tests, multiple MetricsServer instances may be created
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Relay Metrics
    describe_counter!("relay_ticks_total", "Total number of relay ticks, by outcome");
    describe_counter!(
        "relay_events_published_total",
        "Total number of outbox rows published and committed as processed"
    );
    describe_counter!(
        "relay_publish_failures_total",
        "Total number of batch publishes rejected by the broker"
    );
    describe_counter!(
        "relay_tick_errors_total",
        "Total number of ticks abandoned on a database error"
    );
    describe_histogram!(
        "relay_publish_duration_seconds",
        "Time taken to publish one batch"
    );

    // Worker Metrics
    describe_counter!(
        "worker_messages_fetched_total",
        "Total number of messages fetched from the broker"
    );
    describe_counter!(
        "worker_fetch_errors_total",
        "Total number of failed fetches"
    );
    describe_counter!(
        "worker_flushes_total",
        "Total number of completed flushes (applied and committed)"
    );
    describe_counter!(
        "worker_sink_failures_total",
        "Total number of failed sink applies"
    );
    describe_counter!(
        "worker_commit_failures_total",
        "Total number of failed checkpoint commits"
    );
    describe_counter!(
        "worker_messages_quarantined_total",
        "Total number of undecodable messages skipped"
    );
    describe_histogram!(
        "worker_flush_duration_seconds",
        "Time taken to apply and commit one batch, retries included"
    );
}

/// Relay job metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record a tick and its outcome (`idle`, `relayed`, `publish_failed`, `abandoned`).
    pub fn record_tick(outcome: &'static str) {
        counter!("relay_ticks_total", "outcome" => outcome).increment(1);
    }

    /// Record a successfully relayed batch.
    pub fn record_published(count: usize, duration: Duration) {
        counter!("relay_events_published_total").increment(count as u64);
        histogram!("relay_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejected publish.
    pub fn record_publish_failure() {
        counter!("relay_publish_failures_total").increment(1);
    }

    /// Record a tick abandoned on a database error.
    pub fn record_tick_error() {
        counter!("relay_tick_errors_total").increment(1);
    }
}

/// Topic worker metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a fetched message.
    pub fn record_fetch(topic: &str) {
        counter!("worker_messages_fetched_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed fetch.
    pub fn record_fetch_error(topic: &str) {
        counter!("worker_fetch_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a quarantined message.
    pub fn record_quarantined(topic: &str) {
        counter!("worker_messages_quarantined_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed sink apply.
    pub fn record_sink_failure(topic: &str) {
        counter!("worker_sink_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed checkpoint commit.
    pub fn record_commit_failure(topic: &str) {
        counter!("worker_commit_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a completed flush.
    pub fn record_flush(topic: &str, duration: Duration) {
        counter!("worker_flushes_total", "topic" => topic.to_string()).increment(1);
        histogram!("worker_flush_duration_seconds", "topic" => topic.to_string())
            .record(duration.as_secs_f64());
    }
}
