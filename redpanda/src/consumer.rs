//! Per-topic consumer with manual offset commits.

use crate::headers::parse_outbox_headers;
use outbox_relay_core::broker::{BrokerConsumer, BrokerError, BrokerFuture, CommitHandle, ConsumerRecord};
use outbox_relay_core::checkpoint::Checkpoint;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Consumer of a single topic in a single consumer group.
///
/// Auto-commit is off: offsets move only through [`BrokerConsumer::commit`],
/// which waits for the broker to acknowledge the new offsets.
/// A new group starts from the earliest retained message by default, so a
/// freshly deployed ingester sees the topic's whole history.
pub struct RedpandaConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    group: String,
}

impl RedpandaConsumer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaConsumerBuilder {
        RedpandaConsumerBuilder::default()
    }

    fn to_record(&self, message: &BorrowedMessage<'_>) -> ConsumerRecord {
        let handle = CommitHandle::new(message.partition(), message.offset());
        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
        match parse_outbox_headers(message.headers()) {
            Ok((event_id, created_at)) => {
                tracing::trace!(
                    topic = %self.topic,
                    partition = handle.partition,
                    offset = handle.offset,
                    event_id = %event_id,
                    "Received message"
                );
                ConsumerRecord::new(handle, event_id, created_at, payload)
            }
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    partition = handle.partition,
                    offset = handle.offset,
                    error = %e,
                    "Message without readable outbox headers"
                );
                ConsumerRecord::malformed(handle, payload, e.to_string())
            }
        }
    }
}

/// Builder for [`RedpandaConsumer`].
#[derive(Default)]
pub struct RedpandaConsumerBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout_ms: Option<u32>,
}

impl RedpandaConsumerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to consume.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Instances sharing a group split the topic's partitions.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Where a group without committed offsets starts: "earliest" or "latest".
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6000 ms
    #[must_use]
    pub const fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.session_timeout_ms = Some(timeout);
        self
    }

    /// Build the consumer and subscribe it to its topic.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::ConnectionFailed`] if brokers or group are not set, or
    ///   the client cannot be created
    /// - [`BrokerError::InvalidTopic`] if the topic is not set or the
    ///   subscription is rejected
    pub fn build(self) -> Result<RedpandaConsumer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| BrokerError::InvalidTopic("Topic not configured".to_string()))?;
        let group = self
            .group
            .ok_or_else(|| BrokerError::ConnectionFailed("Consumer group not configured".to_string()))?;
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.session_timeout_ms.unwrap_or(6000).to_string(),
            )
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| BrokerError::InvalidTopic(format!("Failed to subscribe to '{topic}': {e}")))?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %group,
            auto_offset_reset = %auto_offset_reset,
            manual_commit = true,
            "Subscribed to topic"
        );

        Ok(RedpandaConsumer {
            consumer: Arc::new(consumer),
            topic,
            group,
        })
    }
}

impl BrokerConsumer for RedpandaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn fetch(&self) -> Pin<Box<dyn Future<Output = Option<Result<ConsumerRecord, BrokerError>>> + Send + '_>> {
        Box::pin(async move {
            let result = match self.consumer.recv().await {
                Ok(message) => Ok(self.to_record(&message)),
                Err(e) => Err(BrokerError::FetchFailed {
                    topic: self.topic.clone(),
                    reason: e.to_string(),
                }),
            };
            // A subscribed consumer has no end of stream.
            Some(result)
        })
    }

    fn commit<'a>(&'a self, checkpoint: &'a Checkpoint) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            if checkpoint.is_empty() {
                return Ok(());
            }

            let mut offsets = TopicPartitionList::new();
            for (partition, next_offset) in checkpoint.iter() {
                offsets
                    .add_partition_offset(&self.topic, partition, Offset::Offset(next_offset))
                    .map_err(|e| BrokerError::CommitFailed {
                        group: self.group.clone(),
                        reason: e.to_string(),
                    })?;
            }

            // A sync commit returns the broker's verdict; an async one only
            // reports that the request was queued.
            let consumer = Arc::clone(&self.consumer);
            tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
                .await
                .map_err(|e| BrokerError::CommitFailed {
                    group: self.group.clone(),
                    reason: format!("commit task failed: {e}"),
                })?
                .map_err(|e| BrokerError::CommitFailed {
                    group: self.group.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(
                topic = %self.topic,
                consumer_group = %self.group,
                checkpoint = ?checkpoint,
                "Offsets committed"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_consumer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaConsumer>();
        assert_sync::<RedpandaConsumer>();
    }

    #[test]
    fn builder_requires_topic_and_group() {
        let no_topic = RedpandaConsumer::builder()
            .brokers("localhost:9092")
            .group("stats-ingest-view")
            .build();
        assert!(matches!(no_topic, Err(BrokerError::InvalidTopic(_))));

        let no_group = RedpandaConsumer::builder()
            .brokers("localhost:9092")
            .topic("view")
            .build();
        assert!(matches!(no_group, Err(BrokerError::ConnectionFailed(_))));
    }
}
