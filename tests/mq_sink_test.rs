mod common;

use common::{row, MockProducer};
use mq_sink::codec::json::{decode_key_entries, message_type};
use mq_sink::dispatcher::Dispatcher;
use mq_sink::filter::{FilterConfig, TableFilter};
use mq_sink::model::{Column, DdlEvent, RowChangedEvent, RowOperation, TableName};
use mq_sink::{Error, MqSink, SinkConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct TestSink {
    sink: MqSink,
    producer: Arc<MockProducer>,
    err_rx: mpsc::Receiver<Error>,
}

/// Builds a sink over a mock producer with the default protocol.
fn make_sink(partitions: i32, filter_config: &FilterConfig) -> TestSink {
    let producer = Arc::new(MockProducer::new(partitions));
    let config = SinkConfig::from_uri("kafka://broker:9092/test-topic").unwrap();
    let filter = Arc::new(TableFilter::new(filter_config).unwrap());
    let (err_tx, err_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let sink = MqSink::new(
        producer.clone(),
        filter,
        &config,
        &HashMap::new(),
        err_tx,
        &cancel,
    )
    .unwrap();
    TestSink {
        sink,
        producer,
        err_rx,
    }
}

/// Commit timestamps carried by every message the mock producer observed
/// on a partition, in delivery order.
fn partition_commit_ts(producer: &MockProducer, partition: i32) -> Vec<u64> {
    producer
        .partition_messages(partition)
        .iter()
        .flat_map(|(key, _)| decode_key_entries(key).unwrap())
        .map(|entry| entry.ts)
        .collect()
}

/// A row whose value payload is roughly `payload_bytes` large once
/// encoded.
fn wide_row(commit_ts: u64, id: i64, payload_bytes: usize) -> RowChangedEvent {
    RowChangedEvent {
        start_ts: commit_ts - 1,
        commit_ts,
        table: TableName::new("app", "blobs"),
        op: RowOperation::Insert,
        columns: vec![
            Column::new("id", json!(id)).handle_key(),
            Column::new("payload", json!("a".repeat(payload_bytes))),
        ],
    }
}

#[tokio::test]
async fn test_flush_delivers_all_rows_and_advances_checkpoint() {
    let t = make_sink(2, &FilterConfig::default());

    // Pick row ids so the three rows split across both partitions the way
    // the dispatcher will route them.
    let dispatcher = Dispatcher::new(&[], 2).unwrap();
    let first = row(10, 7);
    let p0 = dispatcher.dispatch(&first);
    let mut other_id = 8;
    while dispatcher.dispatch(&row(11, other_id)) == p0 {
        other_id += 1;
    }
    let second = row(11, other_id);
    let third = row(12, 7);
    let p1 = dispatcher.dispatch(&second);

    t.sink
        .emit_row_changed_events(vec![first, second, third])
        .await
        .unwrap();
    let checkpoint = t.sink.flush_row_changed_events(15).await.unwrap();
    assert_eq!(checkpoint, 15);
    assert_eq!(t.sink.checkpoint_ts(), 15);

    assert_eq!(partition_commit_ts(&t.producer, p0), vec![10, 12]);
    assert_eq!(partition_commit_ts(&t.producer, p1), vec![11]);

    // Every send was observed before the producer flush that confirmed
    // the checkpoint.
    assert_eq!(t.producer.flush_count(), 1);
    assert_eq!(t.producer.sends_at_last_flush(), t.producer.total_sends());
}

#[tokio::test]
async fn test_flush_replay_is_idempotent() {
    let t = make_sink(2, &FilterConfig::default());

    t.sink
        .emit_row_changed_events(vec![row(10, 1)])
        .await
        .unwrap();
    assert_eq!(t.sink.flush_row_changed_events(15).await.unwrap(), 15);

    let sends = t.producer.total_sends();
    let flushes = t.producer.flush_count();

    // Replaying an older resolved ts returns the current checkpoint
    // without touching the producer.
    assert_eq!(t.sink.flush_row_changed_events(12).await.unwrap(), 15);
    assert_eq!(t.producer.total_sends(), sends);
    assert_eq!(t.producer.flush_count(), flushes);
}

#[tokio::test]
async fn test_checkpoint_is_monotonic() {
    let t = make_sink(2, &FilterConfig::default());

    let mut last = 0;
    for target in [10, 20, 15, 30, 5] {
        let checkpoint = t.sink.flush_row_changed_events(target).await.unwrap();
        assert!(checkpoint >= last);
        last = checkpoint;
    }
    assert_eq!(last, 30);
}

#[tokio::test]
async fn test_batch_splits_at_size_limit() {
    let t = make_sink(1, &FilterConfig::default());

    // Five ~1 MiB rows: the fourth append crosses the 4 MiB cap and forces
    // a flush, the fifth rides the barrier flush.
    let rows: Vec<RowChangedEvent> = (1..=5)
        .map(|i| wide_row(i, i as i64, 1024 * 1024))
        .collect();
    t.sink.emit_row_changed_events(rows).await.unwrap();
    assert_eq!(t.sink.flush_row_changed_events(100).await.unwrap(), 100);

    let messages = t.producer.partition_messages(0);
    assert_eq!(messages.len(), 2);
    assert_eq!(decode_key_entries(&messages[0].0).unwrap().len(), 4);
    assert_eq!(decode_key_entries(&messages[1].0).unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_key_preserves_fifo_order() {
    let t = make_sink(4, &FilterConfig::default());

    let rows: Vec<RowChangedEvent> = (1..=50).map(|ts| row(ts, 42)).collect();
    let dispatcher = Dispatcher::new(&[], 4).unwrap();
    let partition = dispatcher.dispatch(&rows[0]);

    t.sink.emit_row_changed_events(rows).await.unwrap();
    assert_eq!(t.sink.flush_row_changed_events(60).await.unwrap(), 60);

    let observed = partition_commit_ts(&t.producer, partition);
    assert_eq!(observed, (1..=50).collect::<Vec<u64>>());

    // The other partitions saw nothing.
    for p in 0..4 {
        if p != partition {
            assert!(t.producer.partition_messages(p).is_empty());
        }
    }
}

#[tokio::test]
async fn test_filtered_rows_never_reach_the_producer() {
    let filter = FilterConfig {
        ignore_tables: vec!["app.*".to_string()],
        ignore_txn_start_ts: vec![],
    };
    let t = make_sink(2, &filter);

    t.sink
        .emit_row_changed_events(vec![row(10, 1), row(11, 2)])
        .await
        .unwrap();

    // The barrier still completes: workers just have nothing buffered.
    assert_eq!(t.sink.flush_row_changed_events(15).await.unwrap(), 15);
    assert_eq!(t.producer.total_sends(), 0);
    assert_eq!(t.sink.statistics().row_count, 0);
}

#[tokio::test]
async fn test_ddl_broadcasts_synchronously() {
    let t = make_sink(2, &FilterConfig::default());

    let ddl = DdlEvent {
        start_ts: 9,
        commit_ts: 10,
        table: TableName::new("app", "users"),
        query: "ALTER TABLE users ADD COLUMN email varchar(255)".to_string(),
    };
    t.sink.emit_ddl_event(&ddl).await.unwrap();

    let broadcasts = t.producer.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let entries = decode_key_entries(&broadcasts[0].0).unwrap();
    assert_eq!(entries[0].kind, message_type::DDL);
    assert_eq!(entries[0].ts, 10);
}

#[tokio::test]
async fn test_filtered_ddl_is_reported_ignored() {
    let filter = FilterConfig {
        ignore_tables: vec!["s.*".to_string()],
        ignore_txn_start_ts: vec![],
    };
    let t = make_sink(2, &filter);

    let ddl = DdlEvent {
        start_ts: 9,
        commit_ts: 10,
        table: TableName::new("s", "users"),
        query: "DROP TABLE users".to_string(),
    };
    let err = t.sink.emit_ddl_event(&ddl).await.unwrap_err();
    assert!(matches!(err, Error::DdlIgnored));
    assert!(t.producer.broadcasts().is_empty());
    assert_eq!(t.producer.total_sends(), 0);
}

#[tokio::test]
async fn test_checkpoint_ts_broadcast() {
    let t = make_sink(3, &FilterConfig::default());

    t.sink.emit_checkpoint_ts(77).await.unwrap();

    let broadcasts = t.producer.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let entries = decode_key_entries(&broadcasts[0].0).unwrap();
    assert_eq!(entries[0].kind, message_type::RESOLVED);
    assert_eq!(entries[0].ts, 77);
}

#[tokio::test]
async fn test_close_shuts_workers_down_quietly() {
    let mut t = make_sink(2, &FilterConfig::default());

    t.sink
        .emit_row_changed_events(vec![row(10, 1)])
        .await
        .unwrap();
    assert_eq!(t.sink.flush_row_changed_events(15).await.unwrap(), 15);

    t.sink.close().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Worker shutdown through close is not an error.
    assert!(t.err_rx.try_recv().is_err());
}
