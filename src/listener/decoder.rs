//! pgoutput decoder.
//!
//! Decodes the logical replication plugin's binary messages into
//! [`wal::Data`]. Relation messages describe tables ahead of the changes
//! that reference them and are cached by oid; Begin carries the commit
//! timestamp stamped onto every change of the transaction.

use bytes::Buf;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::wal::{Action, Column, Data, Metadata};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct RelationInfo {
    schema: String,
    table: String,
    columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    type_id: u32,
}

pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    commit_timestamp: String,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
            commit_timestamp: String::new(),
        }
    }

    /// Decodes one pgoutput message (the XLogData payload), returning the
    /// row changes it produced. Transaction control and relation messages
    /// produce none.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<Data>> {
        if payload.is_empty() {
            return Ok(vec![]);
        }

        let mut cursor = &payload[1..];
        match payload[0] {
            b'B' => {
                self.decode_begin(&mut cursor)?;
                Ok(vec![])
            }
            b'C' => Ok(vec![]),
            b'R' => {
                self.decode_relation(&mut cursor)?;
                Ok(vec![])
            }
            b'I' => Ok(self.decode_insert(&mut cursor)?.into_iter().collect()),
            b'U' => Ok(self.decode_update(&mut cursor)?.into_iter().collect()),
            b'D' => Ok(self.decode_delete(&mut cursor)?.into_iter().collect()),
            b'T' => self.decode_truncate(&mut cursor),
            b'O' | b'Y' | b'M' => Ok(vec![]),
            other => {
                debug!("unknown pgoutput message type: {}", other as char);
                Ok(vec![])
            }
        }
    }

    fn decode_begin(&mut self, cursor: &mut &[u8]) -> Result<()> {
        if cursor.remaining() < 20 {
            return Err(invalid("BEGIN message too short"));
        }
        let _final_lsn = cursor.get_u64();
        let timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        self.commit_timestamp = format_pg_timestamp(timestamp);
        trace!(xid, "transaction begin");
        Ok(())
    }

    fn decode_relation(&mut self, cursor: &mut &[u8]) -> Result<()> {
        if cursor.remaining() < 4 {
            return Err(invalid("RELATION message too short"));
        }
        let rel_id = cursor.get_u32();
        let schema = read_cstring(cursor)?;
        let table = read_cstring(cursor)?;
        if cursor.remaining() < 3 {
            return Err(invalid("RELATION message too short"));
        }
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            if cursor.remaining() < 1 {
                return Err(invalid("RELATION column truncated"));
            }
            let _flags = cursor.get_u8();
            let name = read_cstring(cursor)?;
            if cursor.remaining() < 8 {
                return Err(invalid("RELATION column truncated"));
            }
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();
            columns.push(ColumnInfo { name, type_id });
        }

        debug!(rel_id, schema = %schema, table = %table, "relation");
        self.relations.insert(
            rel_id,
            RelationInfo {
                schema,
                table,
                columns,
            },
        );
        Ok(())
    }

    fn decode_insert(&mut self, cursor: &mut &[u8]) -> Result<Option<Data>> {
        if cursor.remaining() < 5 {
            return Err(invalid("INSERT message too short"));
        }
        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'N' {
            return Err(invalid(format!(
                "unexpected tuple type in INSERT: {tuple_type}"
            )));
        }

        let relation = self.relation(rel_id)?;
        let columns = decode_tuple(cursor, &relation.columns)?;
        Ok(Some(self.change(&relation, Action::Insert, columns, vec![])))
    }

    fn decode_update(&mut self, cursor: &mut &[u8]) -> Result<Option<Data>> {
        if cursor.remaining() < 5 {
            return Err(invalid("UPDATE message too short"));
        }
        let rel_id = cursor.get_u32();
        let relation = self.relation(rel_id)?;

        let mut identity = vec![];
        let mut tuple_type = cursor.get_u8();
        if tuple_type == b'O' || tuple_type == b'K' {
            identity = decode_tuple(cursor, &relation.columns)?;
            if cursor.remaining() < 1 {
                return Err(invalid("UPDATE message missing new tuple"));
            }
            tuple_type = cursor.get_u8();
        }
        if tuple_type != b'N' {
            return Err(invalid(format!(
                "unexpected tuple type in UPDATE: {tuple_type}"
            )));
        }
        let columns = decode_tuple(cursor, &relation.columns)?;
        Ok(Some(self.change(&relation, Action::Update, columns, identity)))
    }

    fn decode_delete(&mut self, cursor: &mut &[u8]) -> Result<Option<Data>> {
        if cursor.remaining() < 5 {
            return Err(invalid("DELETE message too short"));
        }
        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'O' && tuple_type != b'K' {
            return Err(invalid(format!(
                "unexpected tuple type in DELETE: {tuple_type}"
            )));
        }

        let relation = self.relation(rel_id)?;
        let identity = decode_tuple(cursor, &relation.columns)?;
        Ok(Some(self.change(&relation, Action::Delete, vec![], identity)))
    }

    fn decode_truncate(&mut self, cursor: &mut &[u8]) -> Result<Vec<Data>> {
        if cursor.remaining() < 5 {
            return Err(invalid("TRUNCATE message too short"));
        }
        let num_relations = cursor.get_u32();
        let _options = cursor.get_u8();

        let mut changes = Vec::with_capacity(num_relations as usize);
        for _ in 0..num_relations {
            if cursor.remaining() < 4 {
                return Err(invalid("TRUNCATE message truncated"));
            }
            let rel_id = cursor.get_u32();
            let relation = self.relation(rel_id)?;
            changes.push(self.change(&relation, Action::Truncate, vec![], vec![]));
        }
        Ok(changes)
    }

    fn relation(&self, rel_id: u32) -> Result<RelationInfo> {
        self.relations
            .get(&rel_id)
            .cloned()
            .ok_or_else(|| invalid(format!("unknown relation id: {rel_id}")))
    }

    fn change(
        &self,
        relation: &RelationInfo,
        action: Action,
        columns: Vec<Column>,
        identity: Vec<Column>,
    ) -> Data {
        Data {
            action,
            timestamp: self.commit_timestamp.clone(),
            lsn: String::new(),
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            columns,
            identity,
            metadata: Metadata::default(),
        }
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidMessage {
        message: message.into(),
    }
}

fn read_cstring(cursor: &mut &[u8]) -> Result<String> {
    let end = cursor
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| invalid("unterminated string"))?;
    let s = String::from_utf8_lossy(&cursor[..end]).to_string();
    cursor.advance(end + 1);
    Ok(s)
}

fn decode_tuple(cursor: &mut &[u8], columns: &[ColumnInfo]) -> Result<Vec<Column>> {
    if cursor.remaining() < 2 {
        return Err(invalid("tuple data too short"));
    }
    let num_columns = cursor.get_u16() as usize;
    if num_columns != columns.len() {
        return Err(invalid(format!(
            "column count mismatch: {num_columns} vs {}",
            columns.len()
        )));
    }

    let mut decoded = Vec::with_capacity(num_columns);
    for info in columns {
        if cursor.remaining() < 1 {
            return Err(invalid("tuple column truncated"));
        }
        match cursor.get_u8() {
            b'n' => decoded.push(column(info, serde_json::Value::Null)),
            // unchanged toast value, not present in the message
            b'u' => {}
            b't' => {
                if cursor.remaining() < 4 {
                    return Err(invalid("tuple text value truncated"));
                }
                let len = cursor.get_u32() as usize;
                if cursor.remaining() < len {
                    return Err(invalid("tuple text value truncated"));
                }
                let text = String::from_utf8_lossy(&cursor[..len]).to_string();
                cursor.advance(len);
                decoded.push(column(info, parse_value(&text, info.type_id)));
            }
            b'b' => {
                return Err(invalid("binary tuple values not supported"));
            }
            other => {
                return Err(invalid(format!("unknown tuple column type: {other}")));
            }
        }
    }
    Ok(decoded)
}

fn column(info: &ColumnInfo, value: serde_json::Value) -> Column {
    Column {
        id: String::new(),
        name: info.name.clone(),
        type_name: type_name(info.type_id).to_string(),
        value,
    }
}

fn type_name(type_id: u32) -> &'static str {
    match type_id {
        16 => "bool",
        17 => "bytea",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        25 => "text",
        114 => "json",
        700 => "float4",
        701 => "float8",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1114 => "timestamp",
        1184 => "timestamptz",
        1700 => "numeric",
        2950 => "uuid",
        3802 => "jsonb",
        _ => "unknown",
    }
}

/// Parses the textual column value into a typed JSON value where the type
/// is unambiguous, falling back to the raw string.
fn parse_value(text: &str, type_id: u32) -> serde_json::Value {
    match type_id {
        16 => match text {
            "t" => serde_json::Value::Bool(true),
            "f" => serde_json::Value::Bool(false),
            _ => serde_json::Value::String(text.to_string()),
        },
        20 | 21 | 23 => text
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        700 | 701 => text
            .parse::<f64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        114 | 3802 => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        _ => serde_json::Value::String(text.to_string()),
    }
}

/// Formats a pgoutput timestamp (microseconds since 2000-01-01) as ISO-8601.
fn format_pg_timestamp(micros_since_2000: i64) -> String {
    let epoch = chrono::NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    let ts = epoch + chrono::Duration::microseconds(micros_since_2000);
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}
