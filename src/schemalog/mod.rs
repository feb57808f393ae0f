//! Schema log model.
//!
//! Every schema change in the source database is recorded as a row in the
//! reserved `pgstream.schema_log` table: a monotonically increasing version
//! per schema plus a full snapshot of the schema at that version. The
//! snapshot is what maps mutable column names to the immutable ids stamped
//! onto events.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod store;

pub use store::{PgSchemaLogStore, SchemaLogStore};

/// Reserved schema holding pg-relay internal tables.
pub const SCHEMA_NAME: &str = "pgstream";
/// Table recording schema versions.
pub const TABLE_NAME: &str = "schema_log";

/// Sortable 12-byte identifier of a schema-log row.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaId(xid::Id);

impl SchemaId {
    /// Mints a fresh id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(xid::new())
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SchemaId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.parse().map_err(|_| crate::Error::InvalidMessage {
            message: format!("invalid schema id: {s}"),
        })?;
        Ok(Self(id))
    }
}

impl Serialize for SchemaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| D::Error::custom("invalid schema id"))
    }
}

/// One row of the schema log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: SchemaId,
    pub version: i64,
    pub schema_name: String,
    pub schema: Schema,
    pub created_at: chrono::NaiveDateTime,
    pub acked: bool,
}

/// Snapshot of a schema at one version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub tables: Vec<Table>,
    /// Set on the final entry of a schema that has been dropped.
    #[serde(default)]
    pub dropped: bool,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub pgstream_id: String,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Table {
    pub fn column_id(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.pgstream_id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub pgstream_id: String,
    #[serde(default)]
    pub data_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_id_round_trip() {
        let id = SchemaId::new();
        let s = id.to_string();
        let parsed: SchemaId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_schema_snapshot_lookup() {
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "tables": [{
                "name": "users",
                "pgstream_id": "t1",
                "columns": [
                    {"name": "id", "pgstream_id": "t1-c1", "data_type": "int8"},
                    {"name": "email", "pgstream_id": "t1-c2", "data_type": "text"},
                ],
            }],
        }))
        .unwrap();

        let table = schema.table("users").unwrap();
        assert_eq!(table.pgstream_id, "t1");
        assert_eq!(table.column_id("email"), Some("t1-c2"));
        assert_eq!(table.column_id("renamed"), None);
        assert!(schema.table("missing").is_none());
        assert!(!schema.dropped);
    }
}
