//! Pipeline orchestration.
//!
//! Wires the configured listener to the configured processor chain and
//! checkpointer, runs the batch sender and any side workers, and tears
//! everything down in order on cancellation: the listener stops first, the
//! sender drains with a final flush and checkpoint, then sinks close.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checkpoint::{Checkpointer, KafkaCheckpointer, LsnTracker, PostgresCheckpointer};
use crate::config::{Config, ListenerKind, ProcessorKind};
use crate::kafka::KafkaReader;
use crate::listener::{KafkaListener, Listener, PostgresListener};
use crate::processor::kafka::kafka_batch_writer;
use crate::processor::search::{search_batch_writer, OpenSearchStore};
use crate::processor::webhook::{
    webhook_batch_writer, PgSubscriptionStore, SubscriptionServer, SubscriptionStore,
};
use crate::processor::{Processor, Translator};
use crate::schemalog::PgSchemaLogStore;
use crate::{Error, Result};

type WorkerHandle = (&'static str, JoinHandle<Result<()>>);

/// Runs one pipeline until the token cancels or a fatal error surfaces.
pub async fn run(config: Config, token: CancellationToken) -> Result<()> {
    info!(
        listener = ?config.listener,
        processor = ?config.processor,
        "starting pipeline"
    );

    let listen_result = match config.listener {
        ListenerKind::Postgres => {
            let tracker = Arc::new(LsnTracker::new());
            let checkpointer: Arc<dyn Checkpointer> =
                Arc::new(PostgresCheckpointer::new(tracker.clone()));
            let (processor, workers) = build_processor(&config, checkpointer, &token).await?;

            let mut listener =
                PostgresListener::new(config.postgres.clone(), processor, tracker);
            let result = listener.listen(token.clone()).await;
            drop(listener);
            shutdown(result, workers, &token).await
        }
        ListenerKind::Kafka => {
            let reader = Arc::new(KafkaReader::new(&config.kafka)?);
            let checkpointer: Arc<dyn Checkpointer> =
                Arc::new(KafkaCheckpointer::new(reader.clone()));
            let (processor, workers) = build_processor(&config, checkpointer, &token).await?;

            let mut listener = KafkaListener::new(reader, processor);
            let result = listener.listen(token.clone()).await;
            drop(listener);
            shutdown(result, workers, &token).await
        }
    };

    match listen_result {
        Ok(()) => {
            info!("pipeline stopped");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Builds the processor chain for the configured sink, spawning its sender
/// and side workers.
async fn build_processor(
    config: &Config,
    checkpointer: Arc<dyn Checkpointer>,
    token: &CancellationToken,
) -> Result<(Arc<dyn Processor>, Vec<WorkerHandle>)> {
    match config.processor {
        ProcessorKind::Kafka => {
            let (writer, sender) =
                kafka_batch_writer(&config.kafka, &config.batch, checkpointer)?;
            let sender_task = tokio::spawn(sender.run(token.clone()));
            Ok((Arc::new(writer), vec![("batch sender", sender_task)]))
        }
        ProcessorKind::Search => {
            let store = Arc::new(OpenSearchStore::new(&config.search.url)?);
            let (writer, sender, cleaner) =
                search_batch_writer(store, &config.batch, &config.backoff, checkpointer);

            let schema_store = Arc::new(PgSchemaLogStore::connect(&config.postgres.url()).await?);
            let translator = Translator::new(writer, schema_store);

            let sender_task = tokio::spawn(sender.run(token.clone()));
            let cleaner_token = token.clone();
            let cleaner_task = tokio::spawn(async move {
                cleaner.run(cleaner_token).await;
                Ok::<(), Error>(())
            });
            Ok((
                Arc::new(translator),
                vec![
                    ("batch sender", sender_task),
                    ("schema cleaner", cleaner_task),
                ],
            ))
        }
        ProcessorKind::Webhook => {
            let store: Arc<dyn SubscriptionStore> =
                Arc::new(PgSubscriptionStore::connect(&config.postgres.url()).await?);
            let (writer, sender) =
                webhook_batch_writer(store.clone(), &config.batch, checkpointer)?;

            let schema_store = Arc::new(PgSchemaLogStore::connect(&config.postgres.url()).await?);
            let translator = Translator::new(writer, schema_store);

            let sender_task = tokio::spawn(sender.run(token.clone()));
            let server = SubscriptionServer::new(config.webhook.server_address.clone(), store);
            let server_task = tokio::spawn(server.run(token.clone()));
            Ok((
                Arc::new(translator),
                vec![
                    ("batch sender", sender_task),
                    ("subscription server", server_task),
                ],
            ))
        }
    }
}

/// Joins the side workers and reduces everything to the first fatal error.
/// Cancellation is the clean-shutdown signal, not a failure.
async fn shutdown(
    listen_result: Result<()>,
    workers: Vec<WorkerHandle>,
    token: &CancellationToken,
) -> Result<()> {
    token.cancel();

    let mut fatal = match listen_result {
        Err(e) if !e.is_cancellation() => Some(e),
        _ => None,
    };

    for (name, handle) in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancellation() => {}
            Ok(Err(e)) => {
                error!("{name} failed: {e}");
                fatal.get_or_insert(e);
            }
            Err(e) => {
                error!("{name} panicked: {e}");
                fatal.get_or_insert(Error::Replication {
                    message: format!("{name} task failed: {e}"),
                });
            }
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
