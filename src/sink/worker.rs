//! Per-partition batching worker.

use crate::codec::{Encoder, EncoderFactory, EncoderResult};
use crate::model::RowChangedEvent;
use crate::producer::MqProducer;
use crate::sink::notify::Notifier;
use crate::sink::statistics::Statistics;
use crate::sink::write_to_producer;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Encoded batch size that forces a flush regardless of what the encoder
/// reported for the append.
pub(crate) const BATCH_SIZE_LIMIT: usize = 4 * 1024 * 1024;

/// Latency cap: anything buffered this long is flushed even if the batch
/// is small.
const FLUSH_TICK: Duration = Duration::from_millis(500);

/// One unit of work on a partition channel.
pub(crate) enum WorkItem {
    Row(RowChangedEvent),
    /// Resolved-timestamp barrier: flush everything buffered, then publish
    /// the timestamp.
    Barrier(u64),
}

/// Owns one partition's encoder and drains its input channel.
pub(crate) struct PartitionWorker {
    partition: i32,
    producer: Arc<dyn MqProducer>,
    new_encoder: EncoderFactory,
    encoder: Box<dyn Encoder>,
    /// Events buffered in `encoder`, for statistics.
    batch_size: usize,
    resolved_ts: Arc<Vec<AtomicU64>>,
    notifier: Notifier,
    statistics: Arc<Statistics>,
    cancel: CancellationToken,
}

impl PartitionWorker {
    pub fn new(
        partition: i32,
        producer: Arc<dyn MqProducer>,
        new_encoder: EncoderFactory,
        resolved_ts: Arc<Vec<AtomicU64>>,
        notifier: Notifier,
        statistics: Arc<Statistics>,
        cancel: CancellationToken,
    ) -> Self {
        let encoder = new_encoder();
        Self {
            partition,
            producer,
            new_encoder,
            encoder,
            batch_size: 0,
            resolved_ts,
            notifier,
            statistics,
            cancel,
        }
    }

    pub async fn run(mut self, mut input: mpsc::Receiver<WorkItem>) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut tick = interval(FLUSH_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval completes immediately.
        tick.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tick.tick() => {
                    self.flush_to_producer(EncoderResult::NeedAsyncWrite).await?;
                }
                item = input.recv() => match item {
                    // The sink was dropped; nothing reads the output anymore.
                    None => return Err(Error::Cancelled),
                    Some(WorkItem::Row(row)) => self.handle_row(&row).await?,
                    Some(WorkItem::Barrier(ts)) => self.handle_barrier(ts).await?,
                },
            }
        }
    }

    async fn handle_row(&mut self, row: &RowChangedEvent) -> Result<()> {
        let op = self.encoder.append_row(row).await?;
        self.batch_size += 1;

        if self.encoder.size() >= BATCH_SIZE_LIMIT {
            return self.flush_to_producer(EncoderResult::NeedAsyncWrite).await;
        }
        if matches!(
            op,
            EncoderResult::NeedAsyncWrite | EncoderResult::NeedSyncWrite
        ) {
            return self.flush_to_producer(op).await;
        }
        Ok(())
    }

    async fn handle_barrier(&mut self, ts: u64) -> Result<()> {
        self.flush_to_producer(EncoderResult::NeedAsyncWrite).await?;
        self.resolved_ts[self.partition as usize].store(ts, Ordering::SeqCst);
        self.notifier.notify();
        Ok(())
    }

    /// Builds the buffered batch, installs a fresh encoder and writes the
    /// message out. A no-op when nothing is buffered.
    async fn flush_to_producer(&mut self, op: EncoderResult) -> Result<()> {
        if self.batch_size == 0 {
            return Ok(());
        }
        let (key, value) = self.encoder.build();
        self.encoder = (self.new_encoder)();
        let rows = std::mem::take(&mut self.batch_size);

        let start = Instant::now();
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = write_to_producer(
                self.producer.as_ref(),
                key,
                value,
                op,
                self.partition,
            ) => result?,
        }
        self.statistics.observe_batch(rows, start.elapsed());
        Ok(())
    }
}
