//! Kafka [`Publisher`] built on `rdkafka`.
//!
//! Uses a [`ThreadedProducer`], which polls librdkafka on its own thread so
//! delivery reports are handled without help from the ingestion loop.
//! `publish` only reports failures to enqueue locally. Failed deliveries are
//! counted by [`DeliveryLogger`] and reported through
//! [`Publisher::delivery_failures`].

use super::bus::Publisher;
use crate::{Error, Result};

use rdkafka::ClientConfig;
use rdkafka::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Kafka producer settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap brokers.
    pub brokers: String,

    /// Destination topic.
    /// Default: "tweets"
    pub topic: String,

    /// Producer batching delay.
    /// Default: 50ms
    pub linger_ms: u32,

    /// Time librdkafka keeps retrying a message before reporting failure.
    /// Default: 30s
    pub message_timeout_ms: u32,

    /// Extra attempts when the local producer queue is full.
    /// Default: 1
    pub queue_full_retries: u32,

    /// Pause before retrying a full queue.
    /// Default: 500ms
    pub queue_full_wait: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "redpanda:9092".to_string(),
            topic: "tweets".to_string(),
            linger_ms: 50,
            message_timeout_ms: 30_000,
            queue_full_retries: 1,
            queue_full_wait: Duration::from_millis(500),
        }
    }
}

impl KafkaConfig {
    /// Build the rdkafka client configuration.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config.set("linger.ms", self.linger_ms.to_string());
        config.set("message.timeout.ms", self.message_timeout_ms.to_string());
        config
    }
}

/// Logs and counts failed deliveries reported by librdkafka.
#[derive(Debug, Default)]
pub struct DeliveryLogger {
    failed: Arc<AtomicU64>,
}

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        if let Err((e, _message)) = result {
            self.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bus_publish_errors_total").increment(1);
            tracing::warn!("Kafka delivery failed: {}", e);
        }
    }
}

/// Publishes raw event JSON to one Kafka topic.
pub struct KafkaPublisher {
    config: KafkaConfig,
    producer: ThreadedProducer<DeliveryLogger>,
    failed: Arc<AtomicU64>,
}

impl KafkaPublisher {
    /// Create the producer. Does not wait for the brokers to be reachable.
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let failed = Arc::new(AtomicU64::new(0));
        let context = DeliveryLogger {
            failed: Arc::clone(&failed),
        };
        let producer: ThreadedProducer<DeliveryLogger> = config
            .client_config()
            .create_with_context(context)
            .map_err(|e| Error::Bus(format!("failed to create Kafka producer: {}", e)))?;

        tracing::info!(
            "Kafka forwarding enabled: brokers={} topic={}",
            config.brokers,
            config.topic
        );

        Ok(Self {
            config,
            producer,
            failed,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }
}

impl Publisher for KafkaPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let mut retries = 0;
        loop {
            let outcome = self
                .producer
                .send(BaseRecord::<(), [u8]>::to(&self.config.topic).payload(&payload))
                .map_err(|(e, _record)| e);

            match outcome {
                Ok(()) => return Ok(()),
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull))
                    if retries < self.config.queue_full_retries =>
                {
                    retries += 1;
                    tokio::time::sleep(self.config.queue_full_wait).await;
                }
                Err(e) => return Err(Error::Bus(e.to_string())),
            }
        }
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| Error::Bus(format!("flush: {}", e)))
    }

    fn delivery_failures(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
