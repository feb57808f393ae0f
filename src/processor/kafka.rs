//! Kafka batch writer.
//!
//! Flushes batches to a single topic keyed by schema name, which preserves
//! per-schema ordering through partitioning. Inserts into the schema-log
//! table are keyed by the schema they describe, not by the reserved schema
//! they live in, so schema changes land on the same partition as the data
//! events they precede.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::batch::{batch_writer, BatchConfig, BatchSender, BatchSink, BatchWriter, Message};
use super::{extract_schema_name, is_schema_log_event};
use crate::checkpoint::Checkpointer;
use crate::config::KafkaConfig;
use crate::kafka::{KafkaMessage, KafkaWriter};
use crate::wal::Data;
use crate::{Error, Result};
use std::sync::Arc;

/// Key for a message bound for the sink topic.
fn message_key(data: &Data) -> Result<String> {
    if is_schema_log_event(data) {
        extract_schema_name(data).map_err(Error::UnderstandingEvent)
    } else {
        Ok(data.schema.clone())
    }
}

pub struct KafkaSink {
    writer: KafkaWriter,
}

#[async_trait]
impl BatchSink for KafkaSink {
    fn message_key(&self, data: &Data) -> Result<String> {
        message_key(data)
    }

    async fn write_batch(&self, _token: &CancellationToken, msgs: &[Message]) -> Result<()> {
        let msgs: Vec<KafkaMessage> = msgs
            .iter()
            .map(|m| KafkaMessage {
                key: m.key.clone(),
                payload: m.payload.clone(),
            })
            .collect();
        self.writer.write_messages(&msgs).await
    }

    fn close(&self) -> Result<()> {
        self.writer.close()
    }
}

/// Builds the kafka variant of the batch writer.
pub fn kafka_batch_writer(
    kafka: &KafkaConfig,
    batch: &BatchConfig,
    checkpointer: Arc<dyn Checkpointer>,
) -> Result<(BatchWriter<KafkaSink>, BatchSender<KafkaSink>)> {
    let sink = KafkaSink {
        writer: KafkaWriter::new(kafka)?,
    };
    Ok(batch_writer(sink, checkpointer, batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::batch::tests::{MockCheckpointer, MockSink};
    use crate::processor::tests::{column, schema_log_data};
    use crate::processor::Processor;
    use crate::wal::{CommitPosition, Event};
    use serde_json::json;
    use std::time::Duration;

    /// Mock sink with the kafka key scheme, so admission runs the real
    /// schema-log key extraction without a broker.
    struct KeyedMockSink(MockSink);

    #[async_trait]
    impl BatchSink for KeyedMockSink {
        fn message_key(&self, data: &Data) -> Result<String> {
            message_key(data)
        }

        async fn write_batch(&self, token: &CancellationToken, msgs: &[Message]) -> Result<()> {
            self.0.write_batch(token, msgs).await
        }
    }

    fn schema_log_event(columns: Vec<crate::wal::Column>) -> Event {
        Event {
            data: Some(schema_log_data(columns)),
            position: CommitPosition::from("1/CF54A048"),
        }
    }

    fn test_writer() -> (
        BatchWriter<KeyedMockSink>,
        BatchSender<KeyedMockSink>,
        Arc<MockCheckpointer>,
    ) {
        let checkpointer = MockCheckpointer::new();
        let config = BatchConfig {
            max_batch_size: 10,
            max_batch_bytes: 10_000,
            send_frequency: Duration::from_millis(50),
            max_queue_bytes: 100_000,
        };
        let (writer, sender) = batch_writer(
            KeyedMockSink(MockSink::new()),
            checkpointer.clone(),
            &config,
        );
        (writer, sender, checkpointer)
    }

    #[test]
    fn test_data_event_keyed_by_schema() {
        let data = crate::processor::batch::tests::test_event("orders", "1/0")
            .data
            .unwrap();
        assert_eq!(message_key(&data).unwrap(), "orders");
    }

    #[test]
    fn test_schema_log_event_keyed_by_embedded_schema() {
        let data = schema_log_data(vec![column("schema_name", json!("test_schema"))]);
        assert_eq!(message_key(&data).unwrap(), "test_schema");
    }

    #[tokio::test]
    async fn test_schema_log_event_flows_to_sink() {
        let (writer, sender, _checkpointer) = test_writer();
        let token = CancellationToken::new();
        let sender_task = tokio::spawn(sender.run(token.clone()));

        writer
            .process_event(
                &token,
                schema_log_event(vec![column("schema_name", json!("test_schema"))]),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let writes = writer.sink().0.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0].0, "test_schema");
        drop(writes);

        token.cancel();
        let _ = sender_task.await;
    }

    #[tokio::test]
    async fn test_schema_name_missing_error() {
        let (writer, _sender, _checkpointer) = test_writer();
        let token = CancellationToken::new();

        let err = writer
            .process_event(&token, schema_log_event(vec![]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "kafka batch writer: understanding event: schema_log schema_name not found in columns",
        );
    }

    #[tokio::test]
    async fn test_schema_name_wrong_type_error() {
        let (writer, _sender, _checkpointer) = test_writer();
        let token = CancellationToken::new();

        let err = writer
            .process_event(
                &token,
                schema_log_event(vec![column("schema_name", json!(1))]),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "kafka batch writer: understanding event: schema_log schema_name received is not a string: int",
        );
    }
}
