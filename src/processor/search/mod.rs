//! Search batch writer.
//!
//! Flushes batches as OpenSearch bulk operations. Documents are keyed by
//! `(table pgstream id, row id)` and versioned with the row's `version`
//! column so replays after a restart resolve idempotently. Schema-log events
//! observed in the stream trigger housekeeping: a dropped schema is handed to
//! the cleaner queue for asynchronous index deletion.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::batch::{batch_writer, BatchConfig, BatchSender, BatchSink, BatchWriter, Message};
use super::{extract_schema_name, is_schema_log_event};
use crate::backoff::{retry_notify, BackoffConfig, BackoffError, ExponentialBackoff};
use crate::checkpoint::Checkpointer;
use crate::schemalog::Schema;
use crate::wal::{Action, Data};
use crate::Result;

pub mod cleaner;
pub mod store;

pub use cleaner::{schema_cleaner, SchemaCleaner, SchemaCleanerWorker};
pub use store::{BulkOp, OpenSearchStore, SearchStore};

use store::is_retriable;

pub struct SearchSink {
    store: Arc<dyn SearchStore>,
    cleaner: SchemaCleaner,
    backoff: BackoffConfig,
}

impl SearchSink {
    pub fn new(store: Arc<dyn SearchStore>, cleaner: SchemaCleaner, backoff: BackoffConfig) -> Self {
        Self {
            store,
            cleaner,
            backoff,
        }
    }

    /// Registers housekeeping for a schema-log event; only drops need work
    /// here, mapping updates are handled by index templates.
    async fn handle_schema_change(&self, data: &Data) {
        let schema_name = match extract_schema_name(data) {
            Ok(name) => name,
            Err(e) => {
                warn!(severity = "DATALOSS", "malformed schema_log event: {e}");
                return;
            }
        };

        let dropped = data
            .column_value("schema")
            .map(|value| match value {
                serde_json::Value::String(s) => {
                    serde_json::from_str::<Schema>(s).map(|s| s.dropped).unwrap_or(false)
                }
                other => serde_json::from_value::<Schema>(other.clone())
                    .map(|s| s.dropped)
                    .unwrap_or(false),
            })
            .unwrap_or(false);

        if dropped {
            if let Err(e) = self.cleaner.delete_schema(&schema_name).await {
                error!(schema = %schema_name, "registering schema for clean up: {e}");
            }
        }
    }
}

/// Maps a data event to its bulk operation. `None` when the event carries
/// nothing indexable (no metadata, truncate, or no row id).
fn bulk_op(data: &Data) -> Option<BulkOp> {
    if data.metadata.is_empty() {
        return None;
    }

    let record_id = data.column_value_by_id(&data.metadata.internal_col_id)?;
    let record_id = match record_id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let id = format!("{}_{}", data.metadata.table_id, record_id);
    let version = data
        .column_value_by_id(&data.metadata.internal_col_version)
        .and_then(|v| v.as_i64());

    match data.action {
        Action::Insert | Action::Update => {
            let document: serde_json::Map<String, serde_json::Value> = data
                .columns
                .iter()
                .filter(|c| !c.id.is_empty())
                .map(|c| (c.id.clone(), c.value.clone()))
                .collect();
            Some(BulkOp::Index {
                index: data.schema.clone(),
                id,
                version,
                document: serde_json::Value::Object(document),
            })
        }
        Action::Delete => Some(BulkOp::Delete {
            index: data.schema.clone(),
            id,
            version,
        }),
        Action::Truncate => None,
    }
}

#[async_trait]
impl BatchSink for SearchSink {
    async fn write_batch(&self, _token: &CancellationToken, msgs: &[Message]) -> Result<()> {
        let mut ops = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let Some(data) = &msg.data else { continue };

            if is_schema_log_event(data) {
                self.handle_schema_change(data).await;
                continue;
            }

            match bulk_op(data) {
                Some(op) => ops.push(op),
                None => {
                    warn!(
                        severity = "DATALOSS",
                        schema = %data.schema,
                        table = %data.table,
                        action = %data.action,
                        "event not indexable, skipping"
                    );
                }
            }
        }

        if ops.is_empty() {
            return Ok(());
        }

        debug!(ops = ops.len(), "applying bulk operations");
        let mut policy = ExponentialBackoff::new(&self.backoff);
        let store = self.store.clone();
        let ops = Arc::new(ops);
        retry_notify(
            &mut policy,
            || {
                let store = store.clone();
                let ops = ops.clone();
                async move {
                    store.apply_bulk(&ops).await.map_err(|e| {
                        if is_retriable(&e) {
                            BackoffError::Transient(e)
                        } else {
                            BackoffError::Permanent(e)
                        }
                    })
                }
            },
            |err, backoff| warn!(backoff = ?backoff, "bulk write retry failed: {err}"),
        )
        .await
    }
}

/// Builds the search variant of the batch writer plus its cleaner worker.
pub fn search_batch_writer(
    store: Arc<dyn SearchStore>,
    batch: &BatchConfig,
    backoff: &BackoffConfig,
    checkpointer: Arc<dyn Checkpointer>,
) -> (
    BatchWriter<SearchSink>,
    BatchSender<SearchSink>,
    SchemaCleanerWorker,
) {
    let (cleaner, worker) = schema_cleaner(store.clone(), backoff.clone());
    let sink = SearchSink::new(store, cleaner, backoff.clone());
    let (writer, sender) = batch_writer(sink, checkpointer, batch);
    (writer, sender, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{Column, Metadata};
    use serde_json::json;

    fn enriched_data(action: Action) -> Data {
        Data {
            action,
            timestamp: String::new(),
            lsn: "1/0".to_string(),
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![
                Column {
                    id: "t1-c1".to_string(),
                    name: "id".to_string(),
                    type_name: "int8".to_string(),
                    value: json!(42),
                },
                Column {
                    id: "t1-c2".to_string(),
                    name: "version".to_string(),
                    type_name: "int8".to_string(),
                    value: json!(7),
                },
                Column {
                    id: "t1-c3".to_string(),
                    name: "email".to_string(),
                    type_name: "text".to_string(),
                    value: json!("a@b.co"),
                },
            ],
            identity: vec![],
            metadata: Metadata {
                schema_id: None,
                table_id: "t1".to_string(),
                internal_col_id: "t1-c1".to_string(),
                internal_col_version: "t1-c2".to_string(),
            },
        }
    }

    #[test]
    fn test_insert_becomes_versioned_index_op() {
        let op = bulk_op(&enriched_data(Action::Insert)).unwrap();
        match op {
            BulkOp::Index {
                index,
                id,
                version,
                document,
            } => {
                assert_eq!(index, "public");
                assert_eq!(id, "t1_42");
                assert_eq!(version, Some(7));
                assert_eq!(document["t1-c3"], "a@b.co");
            }
            other => panic!("expected index op, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_becomes_delete_op() {
        let op = bulk_op(&enriched_data(Action::Delete)).unwrap();
        assert!(matches!(op, BulkOp::Delete { id, .. } if id == "t1_42"));
    }

    #[test]
    fn test_unenriched_event_not_indexable() {
        let mut data = enriched_data(Action::Insert);
        data.metadata = Metadata::default();
        assert!(bulk_op(&data).is_none());
    }

    #[test]
    fn test_truncate_not_indexable() {
        assert!(bulk_op(&enriched_data(Action::Truncate)).is_none());
    }
}
