//! OpenSearch-backed document store.
//!
//! Documents are written through the bulk API with external versioning:
//! each operation carries the row's `version` column so replays resolve by
//! optimistic concurrency instead of clobbering newer writes. A version
//! conflict (409) on replay is therefore success.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::{Error, Result};

/// One document operation within a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    Index {
        index: String,
        id: String,
        version: Option<i64>,
        document: serde_json::Value,
    },
    Delete {
        index: String,
        id: String,
        version: Option<i64>,
    },
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Applies all operations in one bulk call.
    async fn apply_bulk(&self, ops: &[BulkOp]) -> Result<()>;

    /// Deletes every document of the schema's index.
    async fn delete_schema(&self, schema_name: &str) -> Result<()>;
}

/// True for errors worth retrying against the search store: connection
/// failures and transient server-side conditions. Client errors other than
/// conflict/throttling never heal on retry.
pub fn is_retriable(err: &Error) -> bool {
    match err {
        Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        Error::Search {
            status: Some(status),
            ..
        } => *status == 429 || *status >= 500,
        _ => false,
    }
}

pub struct OpenSearchStore {
    client: reqwest::Client,
    url: String,
}

impl OpenSearchStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    fn bulk_body(ops: &[BulkOp]) -> Result<String> {
        let mut body = String::new();
        for op in ops {
            let (action, meta_index, meta_id, version, doc) = match op {
                BulkOp::Index {
                    index,
                    id,
                    version,
                    document,
                } => ("index", index, id, version, Some(document)),
                BulkOp::Delete { index, id, version } => ("delete", index, id, version, None),
            };
            let mut meta = json!({ "_index": meta_index, "_id": meta_id });
            if let Some(v) = version {
                meta["version"] = json!(v);
                meta["version_type"] = json!("external");
            }
            body.push_str(&serde_json::to_string(&json!({ action: meta }))?);
            body.push('\n');
            if let Some(doc) = doc {
                body.push_str(&serde_json::to_string(doc)?);
                body.push('\n');
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl SearchStore for OpenSearchStore {
    async fn apply_bulk(&self, ops: &[BulkOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/_bulk", self.url))
            .header("content-type", "application/x-ndjson")
            .body(Self::bulk_body(ops)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Search {
                status: Some(status.as_u16()),
                message: format!("bulk request failed: {}", response.text().await?),
            });
        }

        let body: serde_json::Value = response.json().await?;
        let items = body["items"].as_array().cloned().unwrap_or_default();
        for item in &items {
            let result = item
                .as_object()
                .and_then(|o| o.values().next())
                .cloned()
                .unwrap_or_default();
            let item_status = result["status"].as_u64().unwrap_or(0) as u16;
            match item_status {
                s if s < 300 => {}
                // replayed writes conflict by design; the newer version won
                409 => debug!(id = %result["_id"], "version conflict, already applied"),
                429 | 500..=u16::MAX => {
                    return Err(Error::Search {
                        status: Some(item_status),
                        message: format!("bulk item failed: {result}"),
                    });
                }
                _ => {
                    warn!(
                        severity = "DATALOSS",
                        status = item_status,
                        item = %result,
                        "bulk item rejected, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete_schema(&self, schema_name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.url, schema_name))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        Err(Error::Search {
            status: Some(status.as_u16()),
            message: format!("deleting index {schema_name}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_body_index_with_version() {
        let body = OpenSearchStore::bulk_body(&[BulkOp::Index {
            index: "public".to_string(),
            id: "t1_42".to_string(),
            version: Some(3),
            document: json!({"t1-c2": "a@b.co"}),
        }])
        .unwrap();

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let meta: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta["index"]["_index"], "public");
        assert_eq!(meta["index"]["_id"], "t1_42");
        assert_eq!(meta["index"]["version"], 3);
        assert_eq!(meta["index"]["version_type"], "external");
        let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["t1-c2"], "a@b.co");
    }

    #[test]
    fn test_bulk_body_delete_has_no_document_line() {
        let body = OpenSearchStore::bulk_body(&[BulkOp::Delete {
            index: "public".to_string(),
            id: "t1_42".to_string(),
            version: None,
        }])
        .unwrap();

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        let meta: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta["delete"]["_id"], "t1_42");
        assert!(meta["delete"].get("version").is_none());
    }

    #[test]
    fn test_retriable_classification() {
        assert!(is_retriable(&Error::Search {
            status: Some(503),
            message: String::new(),
        }));
        assert!(is_retriable(&Error::Search {
            status: Some(429),
            message: String::new(),
        }));
        assert!(!is_retriable(&Error::Search {
            status: Some(400),
            message: String::new(),
        }));
        assert!(!is_retriable(&Error::NoRows));
    }
}
