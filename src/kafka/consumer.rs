use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{ClientConfig, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::Offset;
use crate::config::KafkaConfig;
use crate::{Error, Result};

/// A message fetched from the source topic, with the offset it came from.
#[derive(Debug)]
pub struct FetchedMessage {
    pub offset: Offset,
    pub payload: Vec<u8>,
}

/// Consumer-group reader over the WAL topic with manual offset commits.
pub struct KafkaReader {
    consumer: StreamConsumer,
}

impl KafkaReader {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        info!(brokers = ?config.brokers, topic = %config.topic, group = %config.group_id, "creating kafka consumer");

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(Error::Kafka)?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(Error::Kafka)?;

        Ok(Self { consumer })
    }

    /// Fetches the next message, waiting until one arrives or the token is
    /// cancelled.
    pub async fn fetch_message(&self, token: &CancellationToken) -> Result<FetchedMessage> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            msg = self.consumer.recv() => {
                let msg = msg.map_err(Error::Kafka)?;
                let offset = Offset {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                };
                trace!(offset = %offset, "fetched message");
                Ok(FetchedMessage {
                    offset,
                    payload: msg.payload().unwrap_or_default().to_vec(),
                })
            }
        }
    }

    /// Commits the given offsets. Kafka records the next offset to read, so
    /// each committed offset is advanced by one.
    pub fn commit_offsets(&self, offsets: &[Offset]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for o in offsets {
            tpl.add_partition_offset(
                &o.topic,
                o.partition,
                rdkafka::Offset::Offset(o.offset + 1),
            )
            .map_err(Error::Kafka)?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(Error::Kafka)
    }

    /// Leaves the consumer group so partitions re-allocate quickly.
    pub fn close(&self) {
        self.consumer.unsubscribe();
    }
}
