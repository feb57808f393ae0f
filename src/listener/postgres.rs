use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{Client, CopyBothDuplex, NoTls, SimpleQueryMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::decoder::PgOutputDecoder;
use super::Listener;
use crate::checkpoint::LsnTracker;
use crate::config::PostgresConfig;
use crate::processor::Processor;
use crate::wal::{CommitPosition, Event, Lsn};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the Postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Listens to the logical replication stream of a Postgres database.
///
/// Changes decode through [`PgOutputDecoder`]; keep-alives and periodic
/// standby-status updates carry the checkpointer's confirmed-flush LSN back
/// to the server, which is what makes the replication slot advance.
pub struct PostgresListener {
    config: PostgresConfig,
    processor: Arc<dyn Processor>,
    tracker: Arc<LsnTracker>,
    status_interval: Duration,
    decoder: PgOutputDecoder,
}

type ReplicationStream = Pin<Box<CopyBothDuplex<Bytes>>>;

impl PostgresListener {
    pub fn new(
        config: PostgresConfig,
        processor: Arc<dyn Processor>,
        tracker: Arc<LsnTracker>,
    ) -> Self {
        let status_interval = Duration::from_secs(config.standby_status_interval_secs);
        Self {
            config,
            processor,
            tracker,
            status_interval,
            decoder: PgOutputDecoder::new(),
        }
    }

    async fn connect(&self) -> Result<Client> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.replication_url(), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("replication connection error: {e}");
            }
        });
        info!("connected to postgres in replication mode");
        Ok(client)
    }

    async fn create_replication_slot(&self, client: &Client) -> Result<()> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            self.config.slot_name,
        );
        match client.simple_query(&query).await {
            Ok(messages) => {
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        info!(
                            slot = row.get("slot_name").unwrap_or("unknown"),
                            lsn = row.get("consistent_point").unwrap_or("unknown"),
                            "created replication slot"
                        );
                    }
                }
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => {
                debug!(slot = %self.config.slot_name, "replication slot already exists");
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    async fn start_replication(&self, client: &Client) -> Result<ReplicationStream> {
        // 0/0 resumes from the slot's confirmed flush position
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (\"proto_version\" '1', \"publication_names\" '{}')",
            self.config.slot_name, self.config.publication,
        );
        let duplex = client.copy_both_simple::<Bytes>(&query).await?;
        info!(
            slot = %self.config.slot_name,
            publication = %self.config.publication,
            "replication started"
        );
        Ok(Box::pin(duplex))
    }

    async fn process(&self, token: &CancellationToken, event: Event) -> Result<()> {
        if let Err(e) = self.processor.process_event(token, event).await {
            if e.is_cancellation() {
                return Err(e);
            }
            error!(severity = "DATALOSS", "processing wal event: {e}");
        }
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        token: &CancellationToken,
        stream: &mut ReplicationStream,
        frame: Bytes,
    ) -> Result<()> {
        match frame.first() {
            Some(b'k') => {
                let (wal_end, reply_requested) = parse_keepalive(&frame)?;
                if reply_requested {
                    send_status(stream, self.tracker.flushed()).await?;
                }
                self.process(token, Event::keep_alive(CommitPosition::from(wal_end.to_string())))
                    .await
            }
            Some(b'w') => {
                if frame.len() < 25 {
                    return Err(Error::InvalidMessage {
                        message: "XLogData header too short".to_string(),
                    });
                }
                let start_lsn = Lsn(u64::from_be_bytes(
                    frame[1..9].try_into().expect("slice length checked"),
                ));
                let lsn_str = start_lsn.to_string();

                for mut data in self.decoder.decode(&frame[25..])? {
                    data.lsn = lsn_str.clone();
                    let event = Event {
                        data: Some(data),
                        position: CommitPosition::from(lsn_str.as_str()),
                    };
                    self.process(token, event).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Listener for PostgresListener {
    async fn listen(&mut self, token: CancellationToken) -> Result<()> {
        let client = self.connect().await?;
        self.create_replication_slot(&client).await?;
        let mut stream = self.start_replication(&client).await?;

        let mut ticker = tokio::time::interval(self.status_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // one last confirmed-flush report before going away
                    let _ = send_status(&mut stream, self.tracker.flushed()).await;
                    return Err(Error::Cancelled);
                }
                _ = ticker.tick() => {
                    send_status(&mut stream, self.tracker.flushed()).await?;
                }
                frame = stream.next() => match frame {
                    None => {
                        return Err(Error::Replication {
                            message: "replication stream closed by server".to_string(),
                        })
                    }
                    Some(frame) => {
                        let frame = frame?;
                        self.handle_frame(&token, &mut stream, frame).await?;
                    }
                },
            }
        }
    }
}

/// Parses a primary keepalive: WAL end position and whether the server
/// requested an immediate reply.
fn parse_keepalive(frame: &[u8]) -> Result<(Lsn, bool)> {
    if frame.len() < 18 {
        return Err(Error::InvalidMessage {
            message: "keepalive message too short".to_string(),
        });
    }
    let wal_end = u64::from_be_bytes(frame[1..9].try_into().expect("slice length checked"));
    let reply = frame[17] != 0;
    Ok((Lsn(wal_end), reply))
}

/// Builds a standby-status-update message reporting `lsn` as written,
/// flushed and applied.
fn standby_status_update(lsn: Lsn) -> Bytes {
    let timestamp = chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS;
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn.as_u64());
    buf.put_u64(lsn.as_u64());
    buf.put_u64(lsn.as_u64());
    buf.put_i64(timestamp);
    buf.put_u8(0);
    buf.freeze()
}

async fn send_status(stream: &mut ReplicationStream, lsn: Lsn) -> Result<()> {
    debug!(lsn = %lsn, "sending standby status update");
    stream
        .send(standby_status_update(lsn))
        .await
        .map_err(Error::Postgres)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keepalive() {
        let mut frame = vec![b'k'];
        frame.extend_from_slice(&((7u64 << 32) | 0x10).to_be_bytes());
        frame.extend_from_slice(&0i64.to_be_bytes());
        frame.push(1);

        let (lsn, reply) = parse_keepalive(&frame).unwrap();
        assert_eq!(lsn.to_string(), "7/10");
        assert!(reply);

        frame[17] = 0;
        let (_, reply) = parse_keepalive(&frame).unwrap();
        assert!(!reply);
    }

    #[test]
    fn test_parse_keepalive_too_short() {
        assert!(parse_keepalive(&[b'k', 0, 0]).is_err());
    }

    #[test]
    fn test_standby_status_update_layout() {
        let lsn: Lsn = "1/CF54A048".parse().unwrap();
        let msg = standby_status_update(lsn);

        assert_eq!(msg.len(), 34);
        assert_eq!(msg[0], b'r');
        let written = u64::from_be_bytes(msg[1..9].try_into().unwrap());
        let flushed = u64::from_be_bytes(msg[9..17].try_into().unwrap());
        let applied = u64::from_be_bytes(msg[17..25].try_into().unwrap());
        assert_eq!(written, lsn.as_u64());
        assert_eq!(flushed, lsn.as_u64());
        assert_eq!(applied, lsn.as_u64());
        // no reply requested
        assert_eq!(msg[33], 0);
    }
}
