//! # pg-relay
//!
//! A change-data-capture pipeline that streams the PostgreSQL write-ahead
//! log to downstream sinks — a Kafka topic, an OpenSearch cluster, or HTTP
//! webhook subscribers — with at-least-once delivery and in-order
//! per-schema semantics.
//!
//! ## Overview
//!
//! A pipeline is a listener feeding a processor:
//!
//! - the **listener** reads replication events from Postgres (or re-reads
//!   them from a Kafka topic) and hands each one to the processor;
//! - the **translator** (search and webhook pipelines) stamps events with
//!   the stable schema/table/column ids recorded in the schema log;
//! - the **batch writer** bounds in-flight memory with a byte semaphore,
//!   groups events into batches by count, bytes and time, and flushes them
//!   to the sink;
//! - the **checkpointer** acknowledges the furthest flushed position back
//!   upstream — advancing the replication slot or committing consumer
//!   offsets — once the sink write is durable.
//!
//! No commit position is acknowledged upstream until every event at or
//! before it has been handed to the sink; on restart the stream resumes
//! from the last checkpoint and replays at-least-once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_relay::{pipeline, Config, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!     let token = CancellationToken::new();
//!     pipeline::run(config, token).await
//! }
//! ```
//!
//! ## PostgreSQL Setup
//!
//! 1. Enable logical replication in `postgresql.conf`:
//!    ```ini
//!    wal_level = logical
//!    max_replication_slots = 4
//!    max_wal_senders = 4
//!    ```
//!
//! 2. Create a publication for the tables to replicate:
//!    ```sql
//!    CREATE PUBLICATION pg_relay_pub FOR ALL TABLES;
//!    ```
//!
//! The replication slot is created on first start.
//!
//! ## Architecture
//!
//! - [`listener`] - Postgres replication and Kafka listeners
//! - [`processor`] - translator and the batch writer sink variants
//! - [`checkpoint`] - commit-position acknowledgement
//! - [`schemalog`] - schema version model and store
//! - [`wal`] - event model and LSN parsing
//! - [`kafka`] - Kafka clients and offset parsing
//! - [`pipeline`] - orchestration and lifecycle
//! - [`config`] - environment-driven configuration
//! - [`error`] - error types and handling

pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod kafka;
pub mod listener;
pub mod pipeline;
pub mod processor;
pub mod schemalog;
pub mod semaphore;
pub mod wal;

pub use config::Config;
pub use error::{Error, Result};
