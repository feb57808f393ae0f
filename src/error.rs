use thiserror::Error;

use crate::processor::EventError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Invalid message format: {message}")]
    InvalidMessage { message: String },

    #[error("Replication error: {message}")]
    Replication { message: String },

    #[error("no rows")]
    NoRows,

    #[error("requested {requested} bytes exceeds semaphore capacity of {max}")]
    SemaphoreOverflow { requested: usize, max: usize },

    #[error("timeout registering schema for clean up")]
    RegistrationTimeout,

    #[error("kafka batch writer: understanding event: {0}")]
    UnderstandingEvent(#[from] EventError),

    #[error("search store error ({status:?}): {message}")]
    Search {
        status: Option<u16>,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True for errors that terminate the pipeline cleanly rather than
    /// signalling a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
