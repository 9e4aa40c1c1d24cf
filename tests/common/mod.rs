use async_trait::async_trait;
use bytes::Bytes;
use mq_sink::model::{Column, RowChangedEvent, RowOperation, TableName};
use mq_sink::producer::MqProducer;
use mq_sink::Result;
use serde_json::json;
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    sent: Vec<Vec<(Bytes, Bytes)>>,
    broadcasts: Vec<(Bytes, Bytes)>,
    flush_count: usize,
    sends_at_last_flush: usize,
}

/// In-memory producer recording everything the sink hands it.
pub struct MockProducer {
    partitions: i32,
    state: Mutex<MockState>,
}

impl MockProducer {
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions,
            state: Mutex::new(MockState {
                sent: (0..partitions).map(|_| Vec::new()).collect(),
                ..MockState::default()
            }),
        }
    }

    pub fn partition_messages(&self, partition: i32) -> Vec<(Bytes, Bytes)> {
        self.state.lock().unwrap().sent[partition as usize].clone()
    }

    pub fn broadcasts(&self) -> Vec<(Bytes, Bytes)> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flush_count
    }

    pub fn total_sends(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(Vec::len)
            .sum()
    }

    /// How many sends the producer had observed when `flush` last ran.
    pub fn sends_at_last_flush(&self) -> usize {
        self.state.lock().unwrap().sends_at_last_flush
    }
}

#[async_trait]
impl MqProducer for MockProducer {
    fn partition_num(&self) -> i32 {
        self.partitions
    }

    async fn send_message(&self, key: Bytes, value: Bytes, partition: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sent[partition as usize].push((key, value));
        Ok(())
    }

    async fn sync_broadcast_message(&self, key: Bytes, value: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.broadcasts.push((key, value));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.flush_count += 1;
        state.sends_at_last_flush = state.sent.iter().map(Vec::len).sum();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A row change for `app.users` keyed on `id`.
pub fn row(commit_ts: u64, id: i64) -> RowChangedEvent {
    RowChangedEvent {
        start_ts: commit_ts.saturating_sub(1),
        commit_ts,
        table: TableName::new("app", "users"),
        op: RowOperation::Insert,
        columns: vec![
            Column::new("id", json!(id)).handle_key(),
            Column::new("name", json!(format!("user-{id}"))),
        ],
    }
}

