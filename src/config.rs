//! Configuration.
//!
//! All settings load from environment variables, 12-factor style. Required
//! variables depend on the chosen listener and processor; everything else
//! has a sensible default.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_relay::Config;
//!
//! let config = Config::from_env().expect("Failed to load config");
//! println!("listener: {:?}, processor: {:?}", config.listener, config.processor);
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::processor::batch::BatchConfig;
use crate::Error;

/// Main configuration for a pg-relay pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerKind,
    pub processor: ProcessorKind,
    pub postgres: PostgresConfig,
    pub kafka: KafkaConfig,
    pub search: SearchConfig,
    pub webhook: WebhookConfig,
    pub batch: BatchConfig,
    pub backoff: BackoffConfig,
}

/// Where events come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Postgres,
    Kafka,
}

/// Where events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Kafka,
    Search,
    Webhook,
}

/// PostgreSQL connection and replication settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub publication: String,
    pub slot_name: String,
    pub standby_status_interval_secs: u64,
}

impl PostgresConfig {
    /// URL for regular connections (schema log, subscriptions).
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database,
        )
    }

    /// Keyword connection string for the logical replication session.
    pub fn replication_url(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} replication=database",
            self.host, self.port, self.username, self.password, self.database,
        )
    }
}

/// Kafka connection settings, shared by the producer and consumer sides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
    pub compression: String,
    pub acks: String,
    pub linger_ms: u32,
    pub batch_size: usize,
}

/// OpenSearch connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    pub url: String,
}

/// Webhook subscription server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub server_address: String,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// `PGRELAY_LISTENER` (`postgres`|`kafka`) and `PGRELAY_PROCESSOR`
    /// (`kafka`|`search`|`webhook`) select the pipeline shape. Postgres
    /// credentials (`PG_DATABASE`, `PG_USERNAME`, `PG_PASSWORD`) are
    /// required; `KAFKA_BROKERS` is required when Kafka is involved on
    /// either side.
    pub fn from_env() -> crate::Result<Self> {
        let listener = match var_or("PGRELAY_LISTENER", "postgres").as_str() {
            "postgres" => ListenerKind::Postgres,
            "kafka" => ListenerKind::Kafka,
            other => {
                return Err(Error::Config(format!(
                    "PGRELAY_LISTENER must be postgres or kafka, got {other}"
                )))
            }
        };
        let processor = match var_or("PGRELAY_PROCESSOR", "kafka").as_str() {
            "kafka" => ProcessorKind::Kafka,
            "search" => ProcessorKind::Search,
            "webhook" => ProcessorKind::Webhook,
            other => {
                return Err(Error::Config(format!(
                    "PGRELAY_PROCESSOR must be kafka, search or webhook, got {other}"
                )))
            }
        };

        let postgres = PostgresConfig {
            host: var_or("PG_HOST", "localhost"),
            port: parse_var("PG_PORT", 5432),
            database: env::var("PG_DATABASE")
                .map_err(|_| Error::Config("PG_DATABASE is required".to_string()))?,
            username: env::var("PG_USERNAME")
                .map_err(|_| Error::Config("PG_USERNAME is required".to_string()))?,
            password: env::var("PG_PASSWORD")
                .map_err(|_| Error::Config("PG_PASSWORD is required".to_string()))?,
            publication: var_or("PG_PUBLICATION", "pg_relay_pub"),
            slot_name: var_or("PG_SLOT_NAME", "pg_relay_slot"),
            standby_status_interval_secs: parse_var("PG_STANDBY_STATUS_INTERVAL_SECS", 10),
        };

        let needs_kafka = listener == ListenerKind::Kafka || processor == ProcessorKind::Kafka;
        let brokers = env::var("KAFKA_BROKERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if needs_kafka && brokers.is_empty() {
            return Err(Error::Config(
                "KAFKA_BROKERS must contain at least one broker".to_string(),
            ));
        }

        let kafka = KafkaConfig {
            brokers,
            topic: var_or("KAFKA_TOPIC", "pg_relay.wal"),
            group_id: var_or("KAFKA_GROUP_ID", "pg-relay"),
            compression: var_or("KAFKA_COMPRESSION", "snappy"),
            acks: var_or("KAFKA_ACKS", "all"),
            linger_ms: parse_var("KAFKA_LINGER_MS", 100),
            batch_size: parse_var("KAFKA_BATCH_SIZE", 16384),
        };

        let search = SearchConfig {
            url: var_or("SEARCH_URL", "http://localhost:9200"),
        };

        let webhook = WebhookConfig {
            server_address: var_or("WEBHOOK_SERVER_ADDRESS", "0.0.0.0:9900"),
        };

        let defaults = BatchConfig::default();
        let batch = BatchConfig {
            max_batch_size: parse_var("BATCH_MAX_SIZE", defaults.max_batch_size),
            max_batch_bytes: parse_var("BATCH_MAX_BYTES", defaults.max_batch_bytes),
            send_frequency: Duration::from_millis(parse_var(
                "BATCH_SEND_FREQUENCY_MS",
                defaults.send_frequency.as_millis() as u64,
            )),
            max_queue_bytes: parse_var("QUEUE_MAX_BYTES", defaults.max_queue_bytes),
        };

        let defaults = BackoffConfig::default();
        let backoff = BackoffConfig {
            initial_interval: Duration::from_millis(parse_var(
                "BACKOFF_INITIAL_INTERVAL_MS",
                defaults.initial_interval.as_millis() as u64,
            )),
            max_interval: Duration::from_millis(parse_var(
                "BACKOFF_MAX_INTERVAL_MS",
                defaults.max_interval.as_millis() as u64,
            )),
            max_elapsed_time: Duration::from_millis(parse_var(
                "BACKOFF_MAX_ELAPSED_TIME_MS",
                defaults.max_elapsed_time.as_millis() as u64,
            )),
        };

        Ok(Config {
            listener,
            processor,
            postgres,
            kafka,
            search,
            webhook,
            batch,
            backoff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_urls() {
        let config = PostgresConfig {
            host: "db".to_string(),
            port: 5432,
            database: "app".to_string(),
            username: "replicator".to_string(),
            password: "secret".to_string(),
            publication: "pub".to_string(),
            slot_name: "slot".to_string(),
            standby_status_interval_secs: 10,
        };

        assert_eq!(config.url(), "postgres://replicator:secret@db:5432/app");
        assert_eq!(
            config.replication_url(),
            "host=db port=5432 user=replicator password=secret dbname=app replication=database",
        );
    }
}
