//! Batch writer engine.
//!
//! Events are admitted concurrently, bounded in flight by the byte
//! semaphore, and funnelled through a channel into a single sender task that
//! owns the current batch. Funnelling every append through one owner is what
//! keeps batches ordered without a lock. Batches flush when they would
//! overflow the byte or count limit, and on a timer so quiet streams still
//! make progress.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Processor;
use crate::checkpoint::Checkpointer;
use crate::semaphore::ByteSemaphore;
use crate::wal::{CommitPosition, Data, Event};
use crate::{Error, Result};

/// A sink-bound message. Keep-alives carry no payload; they only contribute
/// their commit position to the next checkpoint.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: String,
    pub payload: Bytes,
    /// Decoded event, retained for sinks that need more than raw bytes.
    pub data: Option<Data>,
    pub position: CommitPosition,
}

impl Message {
    fn keep_alive(position: CommitPosition) -> Self {
        Self {
            key: String::new(),
            payload: Bytes::new(),
            data: None,
            position,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.data.is_none()
    }
}

/// Destination of flushed batches.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Partitioning key for a message; per-key order is preserved downstream.
    fn message_key(&self, data: &Data) -> Result<String> {
        Ok(data.schema.clone())
    }

    /// Writes all payload messages of one batch in a single call. An error
    /// here is fatal to the pipeline.
    async fn write_batch(&self, token: &CancellationToken, msgs: &[Message]) -> Result<()>;

    /// Releases sink resources on pipeline shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Batch writer tuning, loaded from the environment as part of the main
/// [`crate::Config`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub send_frequency: Duration,
    pub max_queue_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_bytes: 1_572_864, // 1.5MiB, just under the common broker cap
            send_frequency: Duration::from_millis(500),
            max_queue_bytes: 100 * 1024 * 1024,
        }
    }
}

type EventSerializer = fn(&Data) -> Result<Vec<u8>>;

fn serialize_event(data: &Data) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

/// Admission half of the batch writer; shared by however many callers the
/// listener runs.
pub struct BatchWriter<S> {
    sink: Arc<S>,
    sema: Arc<ByteSemaphore>,
    tx: mpsc::Sender<Message>,
    max_batch_bytes: usize,
    serializer: EventSerializer,
}

/// Sending half: a single task owning the current batch.
pub struct BatchSender<S> {
    sink: Arc<S>,
    checkpointer: Arc<dyn Checkpointer>,
    sema: Arc<ByteSemaphore>,
    rx: mpsc::Receiver<Message>,
    max_batch_bytes: usize,
    max_batch_size: usize,
    send_frequency: Duration,
}

/// Builds the connected admission and sender halves.
pub fn batch_writer<S: BatchSink>(
    sink: S,
    checkpointer: Arc<dyn Checkpointer>,
    config: &BatchConfig,
) -> (BatchWriter<S>, BatchSender<S>) {
    let sink = Arc::new(sink);
    let sema = Arc::new(ByteSemaphore::new(config.max_queue_bytes));
    let (tx, rx) = mpsc::channel(1);
    (
        BatchWriter {
            sink: sink.clone(),
            sema: sema.clone(),
            tx,
            max_batch_bytes: config.max_batch_bytes,
            serializer: serialize_event,
        },
        BatchSender {
            sink,
            checkpointer,
            sema,
            rx,
            max_batch_bytes: config.max_batch_bytes,
            max_batch_size: config.max_batch_size,
            send_frequency: config.send_frequency,
        },
    )
}

impl<S: BatchSink> BatchWriter<S> {
    #[cfg(test)]
    pub(crate) fn with_serializer(mut self, serializer: EventSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    async fn admit(&self, token: &CancellationToken, event: Event) -> Result<()> {
        let Event { data, position } = event;

        let msg = match data {
            None => Message::keep_alive(position),
            Some(data) => {
                let key = self.sink.message_key(&data)?;
                let payload = Bytes::from((self.serializer)(&data)?);
                if payload.len() > self.max_batch_bytes {
                    // Documented data-loss point: the event can never fit a
                    // batch, and its position must never be acknowledged.
                    warn!(
                        severity = "DATALOSS",
                        size = payload.len(),
                        max = self.max_batch_bytes,
                        schema = %data.schema,
                        table = %data.table,
                        "event exceeds max batch bytes, dropping"
                    );
                    return Ok(());
                }
                if !self.sema.try_acquire(payload.len()) {
                    self.sema.acquire(token, payload.len()).await?;
                }
                Message {
                    key,
                    payload,
                    data: Some(data),
                    position,
                }
            }
        };

        let acquired = msg.size();
        let send = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            res = self.tx.send(msg) => res.map_err(|_| Error::Cancelled),
        };
        if send.is_err() && acquired > 0 {
            self.sema.release(acquired);
        }
        send
    }
}

#[async_trait]
impl<S: BatchSink> Processor for BatchWriter<S> {
    async fn process_event(&self, token: &CancellationToken, event: Event) -> Result<()> {
        self.admit(token, event).await
    }
}

#[derive(Default)]
struct Batch {
    messages: Vec<Message>,
    positions: Vec<CommitPosition>,
    total_bytes: usize,
}

impl Batch {
    /// Bytes and count the message would add to the batch.
    fn cost(msg: &Message) -> (usize, usize) {
        if msg.is_keep_alive() {
            (0, 0)
        } else {
            (msg.size(), 1)
        }
    }

    fn add(&mut self, msg: Message) {
        self.positions.push(msg.position.clone());
        if !msg.is_keep_alive() {
            self.total_bytes += msg.size();
            self.messages.push(msg);
        }
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.positions.clear();
        self.total_bytes = 0;
    }
}

impl<S: BatchSink> BatchSender<S> {
    /// Runs the sender loop until cancellation or a fatal sink error, then
    /// closes the sink. On cancellation one best-effort final flush runs
    /// first, to minimize re-delivery after restart.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let result = self.send_loop(&token).await;
        if let Err(e) = self.sink.close() {
            error!("closing sink: {e}");
        }
        result
    }

    async fn send_loop(&mut self, token: &CancellationToken) -> Result<()> {
        let mut batch = Batch::default();
        let mut ticker = tokio::time::interval(self.send_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = self.send_batch(token, &mut batch).await {
                        error!("final flush on shutdown: {e}");
                    }
                    return Err(Error::Cancelled);
                }
                _ = ticker.tick() => {
                    self.send_batch(token, &mut batch).await?;
                }
                msg = self.rx.recv() => match msg {
                    None => {
                        // all writers gone; drain and stop
                        self.send_batch(token, &mut batch).await?;
                        return Ok(());
                    }
                    Some(msg) => {
                        let (bytes, count) = Batch::cost(&msg);
                        if batch.total_bytes + bytes > self.max_batch_bytes
                            || batch.messages.len() + count > self.max_batch_size
                        {
                            self.send_batch(token, &mut batch).await?;
                        }
                        batch.add(msg);
                    }
                },
            }
        }
    }

    async fn send_batch(&self, token: &CancellationToken, batch: &mut Batch) -> Result<()> {
        if batch.positions.is_empty() {
            return Ok(());
        }

        // Keep-alive-only batches skip the sink write but still checkpoint.
        if !batch.messages.is_empty() {
            debug!(
                messages = batch.messages.len(),
                bytes = batch.total_bytes,
                "flushing batch"
            );
            self.sink.write_batch(token, &batch.messages).await?;
            self.sema.release(batch.total_bytes);
        }

        if let Err(e) = self.checkpointer.checkpoint(&batch.positions).await {
            // the next successful checkpoint subsumes this one
            error!("checkpointing batch positions: {e}");
        }

        batch.clear();
        Ok(())
    }
}
