use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::Listener;
use crate::kafka::KafkaReader;
use crate::processor::Processor;
use crate::wal::{CommitPosition, Data, Event};
use crate::{Error, Result};

/// Listens to WAL events previously published to Kafka, for pipelines that
/// fan one capture out to several sinks.
pub struct KafkaListener {
    reader: Arc<KafkaReader>,
    processor: Arc<dyn Processor>,
}

impl KafkaListener {
    pub fn new(reader: Arc<KafkaReader>, processor: Arc<dyn Processor>) -> Self {
        Self { reader, processor }
    }
}

#[async_trait]
impl Listener for KafkaListener {
    async fn listen(&mut self, token: CancellationToken) -> Result<()> {
        loop {
            let msg = self.reader.fetch_message(&token).await?;

            let position = CommitPosition::from(msg.offset.to_string());
            let data: Data = serde_json::from_slice(&msg.payload).map_err(|e| Error::InvalidMessage {
                message: format!("unmarshaling message value into wal data: {e}"),
            })?;

            let event = Event {
                data: Some(data),
                position,
            };
            if let Err(e) = self.processor.process_event(&token, event).await {
                if e.is_cancellation() {
                    return Err(e);
                }
                error!(
                    severity = "DATALOSS",
                    offset = %msg.offset,
                    "processing kafka msg: {e}"
                );
            }
        }
    }
}

impl Drop for KafkaListener {
    fn drop(&mut self) {
        // leaving the group promptly lets partitions re-allocate
        self.reader.close();
    }
}
