use bytes::Bytes;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::{Error, Result};

/// A message headed for the sink topic. The key is the schema name, which is
/// what preserves per-schema ordering across partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaMessage {
    pub key: String,
    pub payload: Bytes,
}

/// Thin wrapper over the rdkafka producer writing to a single topic.
pub struct KafkaWriter {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaWriter {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        info!(brokers = ?config.brokers, topic = %config.topic, "creating kafka producer");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.size", config.batch_size.to_string())
            .set("message.timeout.ms", "30000")
            .set("request.timeout.ms", "20000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| {
                error!("failed to create kafka producer: {e}");
                Error::Kafka(e)
            })?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            delivery_timeout: Duration::from_secs(30),
        })
    }

    /// Writes all messages and waits for every delivery report. Any failed
    /// delivery fails the whole call; the caller treats that as fatal.
    pub async fn write_messages(&self, msgs: &[KafkaMessage]) -> Result<()> {
        let mut deliveries = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let record = rdkafka::producer::FutureRecord::to(&self.topic)
                .key(msg.key.as_bytes())
                .payload(msg.payload.as_ref());
            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => {
                    error!("failed to queue message for delivery: {e}");
                    return Err(Error::Kafka(e));
                }
            }
        }

        for delivery in deliveries {
            match tokio::time::timeout(self.delivery_timeout, delivery).await {
                Ok(Ok(Ok((partition, offset)))) => {
                    debug!(partition, offset, "message delivered");
                }
                Ok(Ok(Err((e, _)))) => return Err(Error::Kafka(e)),
                Ok(Err(_)) | Err(_) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::MessageProduction(
                        rdkafka::types::RDKafkaErrorCode::MessageTimedOut,
                    )))
                }
            }
        }
        Ok(())
    }

    /// Flushes the internal producer queue; called on pipeline shutdown.
    pub fn close(&self) -> Result<()> {
        self.producer
            .flush(Duration::from_secs(10))
            .map_err(Error::Kafka)
    }
}
