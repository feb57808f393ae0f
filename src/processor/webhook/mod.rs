//! Webhook batch writer.
//!
//! Fans each event out to the subscribers matching its `(schema, table,
//! action)` coordinates. Delivery is best-effort with a bounded constant
//! retry per subscriber; one subscriber failing never blocks the others or
//! holds back checkpointing.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::batch::{batch_writer, BatchConfig, BatchSender, BatchSink, BatchWriter, Message};
use crate::checkpoint::Checkpointer;
use crate::{Error, Result};

pub mod server;
pub mod subscription;

pub use server::SubscriptionServer;
pub use subscription::{
    EventFilter, MemorySubscriptionStore, PgSubscriptionStore, Subscription, SubscriptionStore,
};

const DELIVERY_RETRIES: u32 = 3;
const DELIVERY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct WebhookSink {
    store: Arc<dyn SubscriptionStore>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { store, client })
    }

    async fn deliver(&self, url: &str, payload: Bytes) {
        let mut policy =
            crate::backoff::ConstantBackoff::new(DELIVERY_RETRY_INTERVAL, DELIVERY_RETRIES);
        let result: std::result::Result<(), Error> = crate::backoff::retry(&mut policy, || {
            let payload = payload.clone();
            async move {
                let response = self
                    .client
                    .post(url)
                    .header("content-type", "application/json")
                    .body(payload)
                    .send()
                    .await
                    .map_err(|e| crate::backoff::BackoffError::Transient(Error::Http(e)))?;

                match response.error_for_status() {
                    Ok(_) => Ok(()),
                    // a subscriber rejecting the payload will keep rejecting it
                    Err(e) if e.status().map_or(false, |s| s.is_client_error()) => {
                        Err(crate::backoff::BackoffError::Permanent(Error::Http(e)))
                    }
                    Err(e) => Err(crate::backoff::BackoffError::Transient(Error::Http(e))),
                }
            }
        })
        .await;

        if let Err(e) = result {
            warn!(url = %url, "webhook delivery failed: {e}");
        }
    }
}

#[async_trait]
impl BatchSink for WebhookSink {
    async fn write_batch(&self, _token: &CancellationToken, msgs: &[Message]) -> Result<()> {
        for msg in msgs {
            let Some(data) = &msg.data else { continue };

            let subscribers = self
                .store
                .matching(&data.schema, &data.table, data.action)
                .await?;
            if subscribers.is_empty() {
                continue;
            }

            debug!(
                schema = %data.schema,
                table = %data.table,
                subscribers = subscribers.len(),
                "notifying subscribers"
            );
            futures::future::join_all(
                subscribers
                    .iter()
                    .map(|sub| self.deliver(&sub.url, msg.payload.clone())),
            )
            .await;
        }
        Ok(())
    }
}

/// Builds the webhook variant of the batch writer.
pub fn webhook_batch_writer(
    store: Arc<dyn SubscriptionStore>,
    batch: &BatchConfig,
    checkpointer: Arc<dyn Checkpointer>,
) -> Result<(BatchWriter<WebhookSink>, BatchSender<WebhookSink>)> {
    let sink = WebhookSink::new(store)?;
    Ok(batch_writer(sink, checkpointer, batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::batch::tests::test_event;
    use crate::wal::Action;
    use std::sync::Mutex;

    /// Store that records lookups, for verifying fan-out coordinates.
    struct RecordingStore {
        lookups: Mutex<Vec<(String, String, Action)>>,
    }

    #[async_trait]
    impl SubscriptionStore for RecordingStore {
        async fn create_subscription(&self, _subscription: &Subscription) -> Result<()> {
            Ok(())
        }

        async fn delete_subscription(&self, _subscription: &Subscription) -> Result<()> {
            Ok(())
        }

        async fn matching(
            &self,
            schema: &str,
            table: &str,
            action: Action,
        ) -> Result<Vec<Subscription>> {
            self.lookups
                .lock()
                .unwrap()
                .push((schema.to_string(), table.to_string(), action));
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_write_batch_looks_up_event_coordinates() {
        let store = Arc::new(RecordingStore {
            lookups: Mutex::new(vec![]),
        });
        let sink = WebhookSink::new(store.clone()).unwrap();
        let token = CancellationToken::new();

        let event = test_event("public", "1/0");
        let msg = Message {
            key: "public".to_string(),
            payload: Bytes::from_static(b"{}"),
            data: event.data,
            position: event.position,
        };
        sink.write_batch(&token, &[msg]).await.unwrap();

        let lookups = store.lookups.lock().unwrap();
        assert_eq!(
            lookups.as_slice(),
            &[("public".to_string(), "test_table".to_string(), Action::Insert)],
        );
    }

    #[tokio::test]
    async fn test_keep_alive_messages_skipped() {
        let store = Arc::new(RecordingStore {
            lookups: Mutex::new(vec![]),
        });
        let sink = WebhookSink::new(store.clone()).unwrap();
        let token = CancellationToken::new();

        let msg = Message {
            key: String::new(),
            payload: Bytes::new(),
            data: None,
            position: crate::wal::CommitPosition::from("1/0"),
        };
        sink.write_batch(&token, &[msg]).await.unwrap();

        assert!(store.lookups.lock().unwrap().is_empty());
    }
}
