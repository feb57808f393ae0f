//! Kafka wire types and clients.
//!
//! The producer side is used by the kafka sink; the consumer side feeds the
//! kafka listener. [`Offset`] is the commit-position currency for pipelines
//! reading from Kafka.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

pub mod consumer;
pub mod producer;

pub use consumer::{FetchedMessage, KafkaReader};
pub use producer::{KafkaMessage, KafkaWriter};

/// Position of a message within a Kafka topic, encoded canonically as
/// `topic:partition:offset`. Comparison is lexicographic on the triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

impl FromStr for Offset {
    type Err = Error;

    // topics may contain ':' so the split is anchored at the right
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, ':');
        let offset = parts.next().ok_or_else(|| Error::InvalidOffset(s.to_string()))?;
        let partition = parts.next().ok_or_else(|| Error::InvalidOffset(s.to_string()))?;
        let topic = parts.next().ok_or_else(|| Error::InvalidOffset(s.to_string()))?;
        if topic.is_empty() {
            return Err(Error::InvalidOffset(s.to_string()));
        }
        Ok(Offset {
            topic: topic.to_string(),
            partition: partition
                .parse()
                .map_err(|_| Error::InvalidOffset(s.to_string()))?,
            offset: offset
                .parse()
                .map_err(|_| Error::InvalidOffset(s.to_string()))?,
        })
    }
}
