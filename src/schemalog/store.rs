//! Schema-log persistence.

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, error};

use super::{LogEntry, Schema, SCHEMA_NAME, TABLE_NAME};
use crate::{Error, Result};

#[async_trait]
pub trait SchemaLogStore: Send + Sync {
    /// Returns the highest-version entry for the schema, optionally
    /// restricted to acked entries. [`Error::NoRows`] when none exists.
    async fn fetch(&self, schema_name: &str, acked_only: bool) -> Result<LogEntry>;

    /// Marks the entry as acked.
    async fn ack(&self, entry: &LogEntry) -> Result<()>;
}

/// Postgres-backed schema-log store.
pub struct PgSchemaLogStore {
    client: tokio_postgres::Client,
}

impl PgSchemaLogStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("schema log store connection error: {e}");
            }
        });
        Ok(Self { client })
    }
}

fn fetch_query(acked_only: bool) -> String {
    format!(
        "select id, version, schema_name, schema, created_at, acked from {SCHEMA_NAME}.{TABLE_NAME} where schema_name = $1{} order by version desc limit 1",
        if acked_only { " and acked" } else { "" },
    )
}

fn ack_query() -> String {
    format!("update {SCHEMA_NAME}.{TABLE_NAME} set acked = true where id = $1 and schema_name = $2")
}

#[async_trait]
impl SchemaLogStore for PgSchemaLogStore {
    async fn fetch(&self, schema_name: &str, acked_only: bool) -> Result<LogEntry> {
        let row = self
            .client
            .query_opt(&fetch_query(acked_only), &[&schema_name])
            .await?
            .ok_or(Error::NoRows)?;

        let id: String = row.try_get("id")?;
        let schema: serde_json::Value = row.try_get("schema")?;
        let schema: Schema = serde_json::from_value(schema)?;

        let entry = LogEntry {
            id: id.parse()?,
            version: row.try_get("version")?,
            schema_name: row.try_get("schema_name")?,
            schema,
            created_at: row.try_get("created_at")?,
            acked: row.try_get("acked")?,
        };
        debug!(schema = %entry.schema_name, version = entry.version, "fetched schema log entry");
        Ok(entry)
    }

    async fn ack(&self, entry: &LogEntry) -> Result<()> {
        self.client
            .execute(
                &ack_query(),
                &[&entry.id.to_string(), &entry.schema_name],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_query_shape() {
        assert_eq!(
            fetch_query(false),
            "select id, version, schema_name, schema, created_at, acked from pgstream.schema_log where schema_name = $1 order by version desc limit 1",
        );
        assert_eq!(
            fetch_query(true),
            "select id, version, schema_name, schema, created_at, acked from pgstream.schema_log where schema_name = $1 and acked order by version desc limit 1",
        );
    }

    #[test]
    fn test_ack_query_shape() {
        assert_eq!(
            ack_query(),
            "update pgstream.schema_log set acked = true where id = $1 and schema_name = $2",
        );
    }
}
