//! Event listeners.
//!
//! A listener pulls events from a source — the Postgres replication
//! protocol or a Kafka topic — and hands each one to the configured
//! processor. Processor errors other than cancellation are logged at
//! DATALOSS severity and the stream continues; fetch and decode errors are
//! fatal.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub mod decoder;
pub mod kafka;
pub mod postgres;

pub use kafka::KafkaListener;
pub use postgres::PostgresListener;

#[async_trait]
pub trait Listener {
    /// Streams events until cancellation or a fatal error.
    async fn listen(&mut self, token: CancellationToken) -> Result<()>;
}
