//! Schema cleanup queue.
//!
//! Dropped schemas are deleted from the search store asynchronously through
//! a bounded queue, so a slow or unavailable store never stalls the event
//! pipeline. Deletions retry with exponential backoff; errors the store
//! marks non-retriable short-circuit as permanent.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::store::{is_retriable, SearchStore};
use crate::backoff::{retry_notify, BackoffConfig, BackoffError, ExponentialBackoff};
use crate::{Error, Result};

const MAX_DELETE_QUEUE_SIZE: usize = 5000;
const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Enqueueing half of the cleaner.
pub struct SchemaCleaner {
    tx: mpsc::Sender<String>,
    registration_timeout: Duration,
}

/// Worker half, draining the queue against the store.
pub struct SchemaCleanerWorker {
    rx: mpsc::Receiver<String>,
    store: Arc<dyn SearchStore>,
    backoff: BackoffConfig,
}

pub fn schema_cleaner(
    store: Arc<dyn SearchStore>,
    backoff: BackoffConfig,
) -> (SchemaCleaner, SchemaCleanerWorker) {
    let (tx, rx) = mpsc::channel(MAX_DELETE_QUEUE_SIZE);
    (
        SchemaCleaner {
            tx,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        },
        SchemaCleanerWorker { rx, store, backoff },
    )
}

impl SchemaCleaner {
    /// Registers a schema for deletion. Fails with
    /// [`Error::RegistrationTimeout`] if the queue stays full for the
    /// registration timeout.
    pub async fn delete_schema(&self, schema_name: &str) -> Result<()> {
        tokio::time::timeout(
            self.registration_timeout,
            self.tx.send(schema_name.to_string()),
        )
        .await
        .map_err(|_| Error::RegistrationTimeout)?
        .map_err(|_| Error::RegistrationTimeout)
    }

    /// Closes the queue; the worker drains what is left and stops.
    pub fn stop(self) {
        drop(self.tx);
    }
}

impl SchemaCleanerWorker {
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let schema = tokio::select! {
                _ = token.cancelled() => return,
                schema = self.rx.recv() => match schema {
                    Some(schema) => schema,
                    None => return,
                },
            };

            let mut policy = ExponentialBackoff::new(&self.backoff);
            let store = self.store.clone();
            let result = retry_notify(
                &mut policy,
                || {
                    let store = store.clone();
                    let schema = schema.clone();
                    async move {
                        store.delete_schema(&schema).await.map_err(|e| {
                            if is_retriable(&e) {
                                BackoffError::Transient(e)
                            } else {
                                BackoffError::Permanent(e)
                            }
                        })
                    }
                },
                |err, backoff| {
                    warn!(schema = %schema, backoff = ?backoff, "schema cleaner: delete schema retry failed: {err}");
                },
            )
            .await;

            if let Err(e) = result {
                error!(schema = %schema, "schema cleaner: delete schema: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct MockSearchStore {
        deleted: Mutex<Vec<String>>,
        failures_before_success: AtomicU32,
        permanent: bool,
    }

    impl MockSearchStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                deleted: Mutex::new(vec![]),
                failures_before_success: AtomicU32::new(0),
                permanent: false,
            })
        }

        fn flaky(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                deleted: Mutex::new(vec![]),
                failures_before_success: AtomicU32::new(failures),
                permanent: false,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                deleted: Mutex::new(vec![]),
                failures_before_success: AtomicU32::new(u32::MAX),
                permanent: true,
            })
        }
    }

    #[async_trait]
    impl SearchStore for MockSearchStore {
        async fn apply_bulk(&self, _ops: &[super::super::store::BulkOp]) -> Result<()> {
            Ok(())
        }

        async fn delete_schema(&self, schema_name: &str) -> Result<()> {
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success
                    .store(remaining.saturating_sub(1), Ordering::SeqCst);
                return Err(Error::Search {
                    status: Some(if self.permanent { 400 } else { 503 }),
                    message: "unavailable".to_string(),
                });
            }
            self.deleted.lock().unwrap().push(schema_name.to_string());
            Ok(())
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed_time: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_delete_schema_drained() {
        let store = MockSearchStore::new();
        let (cleaner, worker) = schema_cleaner(store.clone(), fast_backoff());
        let token = CancellationToken::new();
        let worker_task = tokio::spawn(worker.run(token.clone()));

        cleaner.delete_schema("dropped_schema").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.deleted.lock().unwrap().as_slice(),
            &["dropped_schema".to_string()],
        );

        token.cancel();
        worker_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let store = MockSearchStore::flaky(2);
        let (cleaner, worker) = schema_cleaner(store.clone(), fast_backoff());
        let token = CancellationToken::new();
        let worker_task = tokio::spawn(worker.run(token.clone()));

        cleaner.delete_schema("flaky_schema").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.deleted.lock().unwrap().len(), 1);

        token.cancel();
        worker_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried_forever() {
        let store = MockSearchStore::broken();
        let (cleaner, worker) = schema_cleaner(store.clone(), fast_backoff());
        let token = CancellationToken::new();
        let worker_task = tokio::spawn(worker.run(token.clone()));

        cleaner.delete_schema("broken_schema").await.unwrap();

        // a permanent (400) failure short-circuits; exactly one attempt
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.failures_before_success.load(Ordering::SeqCst), u32::MAX - 1);

        token.cancel();
        worker_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_queue() {
        let store = MockSearchStore::new();
        let (cleaner, worker) = schema_cleaner(store, fast_backoff());
        let token = CancellationToken::new();
        let worker_task = tokio::spawn(worker.run(token));

        cleaner.stop();
        tokio::time::timeout(Duration::from_secs(1), worker_task)
            .await
            .expect("worker should stop when the queue closes")
            .unwrap();
    }
}
