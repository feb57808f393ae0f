//! Event translation.
//!
//! Sits between the listener and a batch writer. Data events are stamped
//! with the stable identifiers recorded in the schema log: the schema
//! version id, the table id, and per-column ids that survive renames.
//! Inserts into the schema-log table itself are intercepted in-band — the
//! new version is acked and the cached snapshot invalidated — before being
//! forwarded like any other event, so downstream consumers always see a
//! schema version before the first event stamped with it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{extract_schema_name, is_schema_log_event, EventError, Processor};
use crate::schemalog::{LogEntry, Schema, SchemaLogStore};
use crate::wal::{Data, Event};
use crate::{Error, Result};

pub struct Translator<P> {
    inner: P,
    store: Arc<dyn SchemaLogStore>,
    /// Read-mostly snapshot cache, replaced wholesale when a schema version
    /// changes.
    cache: RwLock<HashMap<String, Arc<LogEntry>>>,
}

impl<P: Processor> Translator<P> {
    pub fn new(inner: P, store: Arc<dyn SchemaLogStore>) -> Self {
        Self {
            inner,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    /// Acks the schema-log row carried by an insert event and drops the
    /// stale cached snapshot.
    async fn ack_schema_log(&self, data: &Data) -> Result<()> {
        let schema_name = extract_schema_name(data).map_err(Error::UnderstandingEvent)?;

        let id = match data.column_value("id") {
            Some(serde_json::Value::String(s)) => s.parse()?,
            Some(_) | None => {
                return Err(Error::UnderstandingEvent(EventError::ColumnNotFound {
                    column: "id",
                }))
            }
        };
        let version = match data.column_value("version") {
            Some(serde_json::Value::Number(n)) if n.is_i64() => n.as_i64().unwrap_or_default(),
            _ => {
                return Err(Error::UnderstandingEvent(EventError::ColumnNotFound {
                    column: "version",
                }))
            }
        };
        let schema = match data.column_value("schema") {
            Some(serde_json::Value::String(s)) => {
                serde_json::from_str(s).unwrap_or_else(|_| Schema::default())
            }
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_default(),
            None => Schema::default(),
        };

        let entry = LogEntry {
            id,
            version,
            schema_name: schema_name.clone(),
            schema,
            created_at: chrono::Utc::now().naive_utc(),
            acked: true,
        };
        self.store.ack(&entry).await?;
        debug!(schema = %schema_name, version, "acked schema log entry");

        self.cache.write().expect("schema cache poisoned").remove(&schema_name);
        Ok(())
    }

    /// Current acked entry for a schema, from cache or storage.
    async fn schema_entry(&self, schema_name: &str) -> Result<Arc<LogEntry>> {
        if let Some(entry) = self
            .cache
            .read()
            .expect("schema cache poisoned")
            .get(schema_name)
        {
            return Ok(entry.clone());
        }

        let entry = Arc::new(self.store.fetch(schema_name, true).await?);
        self.cache
            .write()
            .expect("schema cache poisoned")
            .insert(schema_name.to_string(), entry.clone());
        Ok(entry)
    }

    /// Populates metadata and column ids from the schema snapshot. Events
    /// whose schema or table is unknown are forwarded unenriched.
    async fn enrich(&self, data: &mut Data) -> Result<()> {
        let entry = match self.schema_entry(&data.schema).await {
            Ok(entry) => entry,
            Err(Error::NoRows) => {
                warn!(schema = %data.schema, "no acked schema log entry, forwarding unenriched");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(table) = entry.schema.table(&data.table) else {
            warn!(schema = %data.schema, table = %data.table, "table not in schema snapshot");
            return Ok(());
        };

        data.metadata.schema_id = Some(entry.id.clone());
        data.metadata.table_id = table.pgstream_id.clone();
        if let Some(id) = table.column_id("id") {
            data.metadata.internal_col_id = id.to_string();
        }
        if let Some(id) = table.column_id("version") {
            data.metadata.internal_col_version = id.to_string();
        }

        for column in data.columns.iter_mut().chain(data.identity.iter_mut()) {
            match table.column_id(&column.name) {
                Some(id) => column.id = id.to_string(),
                None => {
                    warn!(
                        schema = %data.schema,
                        table = %data.table,
                        column = %column.name,
                        "column not in schema snapshot"
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Processor> Processor for Translator<P> {
    async fn process_event(&self, token: &CancellationToken, mut event: Event) -> Result<()> {
        match &mut event.data {
            None => {}
            Some(data) if is_schema_log_event(data) => {
                self.ack_schema_log(data).await?;
            }
            Some(data) => {
                self.enrich(data).await?;
            }
        }
        self.inner.process_event(token, event).await
    }
}
