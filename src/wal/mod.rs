//! WAL event model.
//!
//! Every change streamed out of a source is represented as an [`Event`]: the
//! decoded row change (if any) plus the opaque [`CommitPosition`] the source
//! can resume from. Keep-alive events carry only the position and are used to
//! advance checkpoints while the source is idle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schemalog::SchemaId;

pub mod lsn;

pub use lsn::Lsn;

/// A single replication event flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Decoded change data. `None` for keep-alive events.
    pub data: Option<Data>,
    /// Position the source can resume from once this event is durable.
    pub position: CommitPosition,
}

impl Event {
    pub fn keep_alive(position: CommitPosition) -> Self {
        Self {
            data: None,
            position,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.data.is_none()
    }
}

/// Row-level change decoded from the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub action: Action,
    /// ISO-8601 commit timestamp, e.g. `2019-12-29 04:58:34.806671`.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub lsn: String,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub identity: Vec<Column>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Data {
    /// Returns the value of the named column, searching `columns` first and
    /// falling back to the identity columns.
    pub fn column_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.columns
            .iter()
            .chain(self.identity.iter())
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    /// Like [`Data::column_value`] but keyed by the immutable column id.
    pub fn column_value_by_id(&self, id: &str) -> Option<&serde_json::Value> {
        if id.is_empty() {
            return None;
        }
        self.columns
            .iter()
            .chain(self.identity.iter())
            .find(|c| c.id == id)
            .map(|c| &c.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    #[serde(rename = "T")]
    Truncate,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Insert => "I",
            Action::Update => "U",
            Action::Delete => "D",
            Action::Truncate => "T",
        };
        f.write_str(s)
    }
}

/// A column of a changed row. The id is the immutable identifier minted from
/// the schema log; it survives column renames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Stable identifiers stamped onto an event by the translator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Schema-log id of the schema version the event was stamped with.
    #[serde(rename = "schema_id", default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<SchemaId>,
    #[serde(rename = "table_pgstream_id", default)]
    pub table_id: String,
    /// Stable id of the `id` column, extracted to key downstream documents.
    #[serde(rename = "id_col_pgstream_id", default)]
    pub internal_col_id: String,
    /// Stable id of the `version` column, used for optimistic concurrency.
    #[serde(rename = "version_col_pgstream_id", default)]
    pub internal_col_version: String,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.table_id.is_empty()
            && self.internal_col_id.is_empty()
            && self.internal_col_version.is_empty()
    }
}

/// Opaque token marking where a source can resume. The source-specific
/// parsers ([`Lsn`], [`crate::kafka::Offset`]) round-trip it to a comparable
/// binary value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitPosition(pub String);

impl CommitPosition {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CommitPosition {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitPosition {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let data = Data {
            action: Action::Insert,
            timestamp: "2019-12-29 04:58:34.806671".to_string(),
            lsn: "1/CF54A048".to_string(),
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![Column {
                id: "cvbhz1lovspk02l3r740-1".to_string(),
                name: "id".to_string(),
                type_name: "int8".to_string(),
                value: json!(42),
            }],
            identity: vec![],
            metadata: Metadata::default(),
        };

        let encoded = serde_json::to_value(&data).unwrap();
        assert_eq!(encoded["action"], "I");
        assert_eq!(encoded["lsn"], "1/CF54A048");
        assert_eq!(encoded["columns"][0]["type"], "int8");
        assert_eq!(encoded["metadata"]["table_pgstream_id"], "");
        assert_eq!(encoded["metadata"]["id_col_pgstream_id"], "");
        assert_eq!(encoded["metadata"]["version_col_pgstream_id"], "");
        assert!(encoded["metadata"].get("schema_id").is_none());

        let decoded: Data = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_metadata_is_empty() {
        assert!(Metadata::default().is_empty());

        let populated = Metadata {
            table_id: "t1".to_string(),
            ..Default::default()
        };
        assert!(!populated.is_empty());
    }

    #[test]
    fn test_column_value_falls_back_to_identity() {
        let data = Data {
            action: Action::Delete,
            timestamp: String::new(),
            lsn: String::new(),
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![],
            identity: vec![Column {
                id: String::new(),
                name: "id".to_string(),
                type_name: "int8".to_string(),
                value: json!(7),
            }],
            metadata: Metadata::default(),
        };

        assert_eq!(data.column_value("id"), Some(&json!(7)));
        assert_eq!(data.column_value("missing"), None);
    }
}
