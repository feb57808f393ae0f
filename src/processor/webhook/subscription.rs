//! Webhook subscriptions.
//!
//! A subscription names a delivery URL and the `(schema, table, action)`
//! combinations it wants; empty fields are wildcards. Subscriptions live in
//! Postgres so they survive restarts; the in-memory store backs tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio_postgres::NoTls;
use tracing::error;

use crate::wal::Action;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub url: String,
    #[serde(default)]
    pub events: Vec<EventFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub action: String,
}

impl Subscription {
    /// True when any filter matches; a subscription with no filters matches
    /// everything.
    pub fn matches(&self, schema: &str, table: &str, action: Action) -> bool {
        if self.events.is_empty() {
            return true;
        }
        self.events.iter().any(|f| {
            (f.schema.is_empty() || f.schema == schema)
                && (f.table.is_empty() || f.table == table)
                && (f.action.is_empty() || f.action == action.to_string())
        })
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn delete_subscription(&self, subscription: &Subscription) -> Result<()>;
    /// All subscriptions matching the event coordinates.
    async fn matching(&self, schema: &str, table: &str, action: Action) -> Result<Vec<Subscription>>;
}

/// In-memory store, keyed by URL.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut subs = self.subscriptions.write().expect("subscriptions poisoned");
        subs.retain(|s| s.url != subscription.url);
        subs.push(subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .write()
            .expect("subscriptions poisoned")
            .retain(|s| s.url != subscription.url);
        Ok(())
    }

    async fn matching(&self, schema: &str, table: &str, action: Action) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .expect("subscriptions poisoned")
            .iter()
            .filter(|s| s.matches(schema, table, action))
            .cloned()
            .collect())
    }
}

/// Postgres-backed store over the `webhook_subscriptions` table.
pub struct PgSubscriptionStore {
    client: tokio_postgres::Client,
}

impl PgSubscriptionStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("subscription store connection error: {e}");
            }
        });
        client
            .execute(
                "create table if not exists webhook_subscriptions (url text primary key, events jsonb not null default '[]')",
                &[],
            )
            .await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<()> {
        let events = serde_json::to_value(&subscription.events)?;
        self.client
            .execute(
                "insert into webhook_subscriptions (url, events) values ($1, $2) on conflict (url) do update set events = $2",
                &[&subscription.url, &events],
            )
            .await?;
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.client
            .execute(
                "delete from webhook_subscriptions where url = $1",
                &[&subscription.url],
            )
            .await?;
        Ok(())
    }

    async fn matching(&self, schema: &str, table: &str, action: Action) -> Result<Vec<Subscription>> {
        // filtering happens in process; subscription counts are small
        let rows = self
            .client
            .query("select url, events from webhook_subscriptions", &[])
            .await?;
        let mut matches = Vec::new();
        for row in rows {
            let events: serde_json::Value = row.try_get("events")?;
            let subscription = Subscription {
                url: row.try_get("url")?,
                events: serde_json::from_value(events)?,
            };
            if subscription.matches(schema, table, action) {
                matches.push(subscription);
            }
        }
        Ok(matches)
    }
}
