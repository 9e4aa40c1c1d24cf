//! The MQ sink: fan-out routing, per-partition batching and the
//! resolved-timestamp barrier protocol.
//!
//! [`MqSink`] accepts an ordered stream of row change events and
//! resolved-timestamp markers. Rows are routed to per-partition workers
//! over bounded channels; each worker batches and encodes its share and
//! hands messages to the producer. [`MqSink::flush_row_changed_events`]
//! pushes a barrier through every partition and advances the sink's
//! checkpoint timestamp once all partitions confirm they flushed up to the
//! barrier and the producer acknowledged everything sent before it.

use crate::codec::{new_encoder_factory, EncoderFactory, EncoderResult};
use crate::config::SinkConfig;
use crate::dispatcher::Dispatcher;
use crate::filter::TableFilter;
use crate::model::{DdlEvent, RowChangedEvent, TableName};
use crate::producer::{KafkaProducer, MqProducer};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod notify;
mod statistics;
mod worker;

pub use statistics::{Statistics, StatisticsSnapshot};

use notify::{notify_channel, NotifyReceiver};
use worker::{PartitionWorker, WorkItem};

/// Debounce window for worker-to-coordinator resolved-ts signals.
const RESOLVED_DEBOUNCE: Duration = Duration::from_millis(50);

/// Pseudo-partition requesting a broadcast to every partition.
const BROADCAST_PARTITION: i32 = -1;

impl std::fmt::Debug for MqSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqSink").finish_non_exhaustive()
    }
}

pub struct MqSink {
    producer: Arc<dyn MqProducer>,
    dispatcher: Dispatcher,
    new_encoder: EncoderFactory,
    filter: Arc<TableFilter>,
    partition_num: i32,
    partition_input: Vec<mpsc::Sender<WorkItem>>,
    partition_resolved_ts: Arc<Vec<AtomicU64>>,
    /// Advanced only by `flush_row_changed_events`.
    checkpoint_ts: AtomicU64,
    resolved_receiver: tokio::sync::Mutex<NotifyReceiver>,
    statistics: Arc<Statistics>,
    /// Child of the caller's token; cancelled by `close` without touching
    /// the caller's scope.
    cancel: CancellationToken,
}

impl MqSink {
    /// Builds a sink over an already constructed producer.
    ///
    /// Spawns one worker task per partition plus a supervisor that posts
    /// the first non-cancellation worker error to `err_tx`. Must be called
    /// within a tokio runtime.
    pub fn new(
        producer: Arc<dyn MqProducer>,
        filter: Arc<TableFilter>,
        config: &SinkConfig,
        opts: &HashMap<String, String>,
        err_tx: mpsc::Sender<Error>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let partition_num = producer.partition_num();
        let dispatcher = Dispatcher::new(&config.dispatch_rules, partition_num)?;
        let new_encoder = new_encoder_factory(config.protocol, &config.topic, opts)?;

        let cancel = cancel.child_token();
        let (notifier, resolved_receiver) = notify_channel(RESOLVED_DEBOUNCE);
        let partition_resolved_ts: Arc<Vec<AtomicU64>> = Arc::new(
            (0..partition_num).map(|_| AtomicU64::new(0)).collect(),
        );
        let statistics = Arc::new(Statistics::new());

        let mut partition_input = Vec::with_capacity(partition_num as usize);
        let mut workers = JoinSet::new();
        for partition in 0..partition_num {
            let (tx, rx) = mpsc::channel(config.partition_channel_size);
            partition_input.push(tx);
            let worker = PartitionWorker::new(
                partition,
                producer.clone(),
                new_encoder.clone(),
                partition_resolved_ts.clone(),
                notifier.clone(),
                statistics.clone(),
                cancel.clone(),
            );
            workers.spawn(worker.run(rx));
        }
        tokio::spawn(Self::supervise(workers, err_tx, cancel.clone()));

        Ok(Self {
            producer,
            dispatcher,
            new_encoder,
            filter,
            partition_num,
            partition_input,
            partition_resolved_ts,
            checkpoint_ts: AtomicU64::new(0),
            resolved_receiver: tokio::sync::Mutex::new(resolved_receiver),
            statistics,
            cancel,
        })
    }

    /// Builds a Kafka-backed sink from a parsed sink URI configuration.
    pub async fn kafka(
        config: &SinkConfig,
        filter: Arc<TableFilter>,
        opts: &HashMap<String, String>,
        err_tx: mpsc::Sender<Error>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if !config.scheme.is_kafka() {
            return Err(Error::Config(
                "MqSink::kafka requires a kafka or kafka+ssl sink URI".to_string(),
            ));
        }
        let producer = Arc::new(KafkaProducer::new(config).await?);
        Self::new(producer, filter, config, opts, err_tx, cancel)
    }

    /// Collects worker exits; the first real error cancels the remaining
    /// workers and is posted to the shared error channel exactly once.
    async fn supervise(
        mut workers: JoinSet<Result<()>>,
        err_tx: mpsc::Sender<Error>,
        cancel: CancellationToken,
    ) {
        let mut first_err: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(Error::Producer(format!("partition worker died: {e}"))),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if first_err.is_none() {
                        cancel.cancel();
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            error!(error = %e, "mq sink worker failed");
            let _ = err_tx.send(e).await;
        }
    }

    /// Routes rows to their partitions.
    ///
    /// Filter-ignored rows are dropped. Returns once every kept row is
    /// enqueued; encoding and producer delivery proceed asynchronously.
    /// Blocks when a destination partition channel is full, propagating
    /// backpressure to the caller.
    pub async fn emit_row_changed_events(&self, rows: Vec<RowChangedEvent>) -> Result<()> {
        let mut rows_count = 0;
        for row in rows {
            if self
                .filter
                .should_ignore_dml(row.start_ts, &row.table.schema, &row.table.table)
            {
                debug!(start_ts = row.start_ts, table = %row.table, "row changed event ignored");
                continue;
            }
            let partition = self.dispatcher.dispatch(&row);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                sent = self.partition_input[partition as usize].send(WorkItem::Row(row)) => {
                    sent.map_err(|_| Error::Cancelled)?;
                }
            }
            rows_count += 1;
        }
        self.statistics.add_rows_count(rows_count);
        Ok(())
    }

    /// Advances the checkpoint to `resolved_ts`.
    ///
    /// Pushes a barrier through every partition, waits until each worker
    /// reports it flushed up to the barrier, then flushes the producer.
    /// Returns the (possibly unchanged) checkpoint timestamp; a target at
    /// or below the current checkpoint returns immediately.
    pub async fn flush_row_changed_events(&self, resolved_ts: u64) -> Result<u64> {
        let checkpoint_ts = self.checkpoint_ts.load(Ordering::Acquire);
        if resolved_ts <= checkpoint_ts {
            return Ok(checkpoint_ts);
        }

        for input in &self.partition_input {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                sent = input.send(WorkItem::Barrier(resolved_ts)) => {
                    sent.map_err(|_| Error::Cancelled)?;
                }
            }
        }

        let mut receiver = self.resolved_receiver.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                wake = receiver.recv() => {
                    if wake.is_none() {
                        return Err(Error::Cancelled);
                    }
                    if self.all_partitions_resolved(resolved_ts) {
                        break;
                    }
                }
            }
        }
        drop(receiver);

        self.producer.flush().await?;
        self.checkpoint_ts.store(resolved_ts, Ordering::Release);
        self.statistics.print_status();
        Ok(resolved_ts)
    }

    fn all_partitions_resolved(&self, target: u64) -> bool {
        self.partition_resolved_ts
            .iter()
            .all(|ts| ts.load(Ordering::SeqCst) >= target)
    }

    /// Broadcasts a checkpoint message if the protocol carries one.
    pub async fn emit_checkpoint_ts(&self, ts: u64) -> Result<()> {
        let mut encoder = (self.new_encoder)();
        let op = encoder.append_resolved(ts).await?;
        if op == EncoderResult::NoOp {
            return Ok(());
        }
        let (key, value) = encoder.build();
        write_to_producer(self.producer.as_ref(), key, value, op, BROADCAST_PARTITION).await
    }

    /// Broadcasts a DDL event if the protocol carries one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DdlIgnored`] when the filter drops the event; the
    /// caller distinguishes this from failure.
    pub async fn emit_ddl_event(&self, ddl: &DdlEvent) -> Result<()> {
        if self
            .filter
            .should_ignore_ddl(ddl.start_ts, &ddl.table.schema, &ddl.table.table)
        {
            info!(
                query = %ddl.query,
                start_ts = ddl.start_ts,
                commit_ts = ddl.commit_ts,
                "DDL event ignored"
            );
            return Err(Error::DdlIgnored);
        }
        let mut encoder = (self.new_encoder)();
        let op = encoder.append_ddl(ddl).await?;
        if op == EncoderResult::NoOp {
            return Ok(());
        }
        let (key, value) = encoder.build();
        info!(query = %ddl.query, commit_ts = ddl.commit_ts, "emit ddl event");
        write_to_producer(self.producer.as_ref(), key, value, op, BROADCAST_PARTITION).await
    }

    /// Extension point for protocols that pre-register table schemas.
    pub async fn initialize(&self, _tables: &[TableName]) -> Result<()> {
        Ok(())
    }

    /// Shuts the sink down: workers unwind through cancellation and the
    /// producer is closed.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.producer.close().await
    }

    pub fn checkpoint_ts(&self) -> u64 {
        self.checkpoint_ts.load(Ordering::Acquire)
    }

    pub fn partition_num(&self) -> i32 {
        self.partition_num
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }
}

/// Writes one encoded message through the operation the encoder asked for.
pub(crate) async fn write_to_producer(
    producer: &dyn MqProducer,
    key: Bytes,
    value: Bytes,
    op: EncoderResult,
    partition: i32,
) -> Result<()> {
    match op {
        EncoderResult::NeedAsyncWrite => {
            if partition >= 0 {
                return producer.send_message(key, value, partition).await;
            }
            Err(Error::UnsupportedOperation(
                "async broadcasts not supported".to_string(),
            ))
        }
        EncoderResult::NeedSyncWrite => {
            if partition >= 0 {
                producer.send_message(key, value, partition).await?;
                return producer.flush().await;
            }
            producer.sync_broadcast_message(key, value).await
        }
        EncoderResult::NoOp => {
            warn!(partition, "write_to_producer called with no-op result");
            Ok(())
        }
    }
}
