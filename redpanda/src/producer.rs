//! Relay-side producer.

use crate::headers::outbox_headers;
use futures::future::join_all;
use outbox_relay_core::broker::{BrokerError, BrokerFuture, BrokerProducer, BrokerRecord};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Redpanda producer for outbox batches.
///
/// Every producer is created with `acks=all` and idempotence enabled, so a
/// record is acknowledged only once all in-sync replicas have it and
/// internal retries never reorder or duplicate within a partition.
///
/// # Example
///
/// ```no_run
/// use outbox_relay_redpanda::RedpandaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = RedpandaProducer::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl RedpandaProducer {
    /// Create a producer with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }
}

/// Builder for [`RedpandaProducer`].
#[derive(Default)]
pub struct RedpandaProducerBuilder {
    brokers: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaProducerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set how long a record may wait for acknowledgement, queueing included.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaProducer`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or
    /// the configuration is rejected.
    pub fn build(self) -> Result<RedpandaProducer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            compression,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Redpanda producer created"
        );

        Ok(RedpandaProducer { producer, timeout })
    }
}

impl BrokerProducer for RedpandaProducer {
    fn publish_batch<'a>(&'a self, records: &'a [BrokerRecord]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            // Enqueued in slice order; idempotence keeps that order per partition.
            let deliveries = records.iter().map(|record| {
                let record_future = self.producer.send(
                    FutureRecord::to(&record.topic)
                        .key(&record.key)
                        .payload(&record.payload)
                        .headers(outbox_headers(record)),
                    Timeout::After(self.timeout),
                );
                async move { (record, record_future.await) }
            });

            let mut first_failure = None;
            let mut failed = 0usize;
            for (record, result) in join_all(deliveries).await {
                match result {
                    Ok((partition, offset)) => tracing::trace!(
                        topic = %record.topic,
                        event_id = %record.event_id,
                        partition,
                        offset,
                        "Record acknowledged"
                    ),
                    Err((kafka_error, _)) => {
                        failed += 1;
                        tracing::debug!(
                            topic = %record.topic,
                            event_id = %record.event_id,
                            error = %kafka_error,
                            "Record not acknowledged"
                        );
                        if first_failure.is_none() {
                            first_failure = Some(BrokerError::PublishFailed {
                                topic: record.topic.clone(),
                                reason: kafka_error.to_string(),
                            });
                        }
                    }
                }
            }

            match first_failure {
                None => Ok(()),
                Some(error) => {
                    tracing::error!(
                        failed,
                        batch = records.len(),
                        error = %error,
                        "Batch publish failed"
                    );
                    Err(error)
                }
            }
        })
    }
}
