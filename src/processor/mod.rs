//! Event processors.
//!
//! A processor receives every event the listener produces. The batch writer
//! variants buffer, flush and checkpoint; the translator wraps another
//! processor to stamp events with stable schema identifiers first.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::schemalog;
use crate::wal::{Action, Data, Event};
use crate::Result;

pub mod batch;
pub mod kafka;
pub mod search;
pub mod translator;
pub mod webhook;

pub use translator::Translator;

#[async_trait]
pub trait Processor: Send + Sync {
    /// Handles one event. Returns only `Ok` or a cancellation error under
    /// normal operation; anything else is logged by the listener at DATALOSS
    /// severity and the stream continues.
    async fn process_event(&self, token: &CancellationToken, event: Event) -> Result<()>;
}

/// Violations of the schema-log event shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("schema_log schema_name not found in columns")]
    SchemaNameNotFound,

    #[error("schema_log schema_name received is not a string: {type_name}")]
    SchemaNameNotString { type_name: &'static str },

    #[error("schema_log {column} not found in columns")]
    ColumnNotFound { column: &'static str },
}

/// True for inserts into the reserved schema-log table, i.e. schema changes
/// flowing through the pipeline in-band.
pub fn is_schema_log_event(data: &Data) -> bool {
    data.schema == schemalog::SCHEMA_NAME
        && data.table == schemalog::TABLE_NAME
        && data.action == Action::Insert
}

/// Extracts the `schema_name` column of a schema-log event.
pub fn extract_schema_name(data: &Data) -> std::result::Result<String, EventError> {
    let value = data
        .column_value("schema_name")
        .ok_or(EventError::SchemaNameNotFound)?;
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(EventError::SchemaNameNotString {
            type_name: json_type_name(other),
        }),
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_f64() => "float",
        serde_json::Value::Number(_) => "int",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
