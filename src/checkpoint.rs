//! Checkpointing.
//!
//! After a batch reaches the sink, the furthest commit position it contained
//! is durably acknowledged upstream: for Postgres by advancing the
//! replication slot's confirmed-flush LSN (via the standby-status updates the
//! listener sends), for Kafka by committing the consumer offsets. Losing a
//! checkpoint call is safe — the checkpointer always takes the maximum, so
//! the next call subsumes it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::kafka::{KafkaReader, Offset};
use crate::wal::{CommitPosition, Lsn};
use crate::Result;

#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Durably acknowledges the maximum of `positions` upstream. Idempotent:
    /// positions at or below the current cursor are a no-op.
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()>;
}

/// Shared cursor of the furthest LSN safely handed to the sink. Written by
/// the checkpointer, read by the replication listener when it builds
/// standby-status updates.
#[derive(Debug, Default)]
pub struct LsnTracker {
    flushed: AtomicU64,
}

impl LsnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the cursor, never backwards. Returns true if it moved.
    pub fn advance(&self, lsn: Lsn) -> bool {
        self.flushed.fetch_max(lsn.as_u64(), Ordering::AcqRel) < lsn.as_u64()
    }

    pub fn flushed(&self) -> Lsn {
        Lsn(self.flushed.load(Ordering::Acquire))
    }
}

/// Advances the replication slot cursor for pipelines reading straight from
/// Postgres.
pub struct PostgresCheckpointer {
    tracker: Arc<LsnTracker>,
}

impl PostgresCheckpointer {
    pub fn new(tracker: Arc<LsnTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Checkpointer for PostgresCheckpointer {
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()> {
        let mut max: Option<Lsn> = None;
        for pos in positions {
            let lsn: Lsn = pos.as_str().parse()?;
            max = Some(max.map_or(lsn, |m| m.max(lsn)));
        }
        if let Some(lsn) = max {
            if self.tracker.advance(lsn) {
                debug!(lsn = %lsn, "advanced confirmed flush lsn");
            }
        }
        Ok(())
    }
}

/// Commits consumer offsets for pipelines re-reading the WAL from Kafka.
pub struct KafkaCheckpointer {
    reader: Arc<KafkaReader>,
}

impl KafkaCheckpointer {
    pub fn new(reader: Arc<KafkaReader>) -> Self {
        Self { reader }
    }
}

/// Reduces positions to the maximum offset per (topic, partition).
fn max_offsets(positions: &[CommitPosition]) -> Result<Vec<Offset>> {
    let mut max: HashMap<(String, i32), Offset> = HashMap::new();
    for pos in positions {
        let offset: Offset = pos.as_str().parse()?;
        let key = (offset.topic.clone(), offset.partition);
        match max.get(&key) {
            Some(existing) if existing.offset >= offset.offset => {}
            _ => {
                max.insert(key, offset);
            }
        }
    }
    Ok(max.into_values().collect())
}

#[async_trait]
impl Checkpointer for KafkaCheckpointer {
    async fn checkpoint(&self, positions: &[CommitPosition]) -> Result<()> {
        let offsets = max_offsets(positions)?;
        if offsets.is_empty() {
            return Ok(());
        }
        self.reader.commit_offsets(&offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_postgres_checkpoint_takes_maximum() {
        let tracker = Arc::new(LsnTracker::new());
        let checkpointer = PostgresCheckpointer::new(tracker.clone());

        checkpointer
            .checkpoint(&[
                CommitPosition::from("0/10"),
                CommitPosition::from("0/30"),
                CommitPosition::from("0/20"),
            ])
            .await
            .unwrap();

        assert_eq!(tracker.flushed().to_string(), "0/30");
    }

    #[tokio::test]
    async fn test_postgres_checkpoint_never_regresses() {
        let tracker = Arc::new(LsnTracker::new());
        let checkpointer = PostgresCheckpointer::new(tracker.clone());

        checkpointer
            .checkpoint(&[CommitPosition::from("1/0")])
            .await
            .unwrap();
        checkpointer
            .checkpoint(&[CommitPosition::from("0/FF")])
            .await
            .unwrap();

        assert_eq!(tracker.flushed().to_string(), "1/0");
    }

    #[tokio::test]
    async fn test_postgres_checkpoint_invalid_position() {
        let checkpointer = PostgresCheckpointer::new(Arc::new(LsnTracker::new()));
        assert!(checkpointer
            .checkpoint(&[CommitPosition::from("bogus")])
            .await
            .is_err());
    }

    #[test]
    fn test_max_offsets_per_partition() {
        let offsets = max_offsets(&[
            CommitPosition::from("events:0:5"),
            CommitPosition::from("events:0:9"),
            CommitPosition::from("events:1:2"),
            CommitPosition::from("events:0:7"),
        ])
        .unwrap();

        let mut by_partition: Vec<_> = offsets.iter().map(|o| (o.partition, o.offset)).collect();
        by_partition.sort();
        assert_eq!(by_partition, vec![(0, 9), (1, 2)]);
    }

    #[test]
    fn test_empty_positions() {
        assert!(max_offsets(&[]).unwrap().is_empty());
    }
}
