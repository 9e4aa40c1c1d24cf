//! Default wire protocol: length-prefixed JSON batches.
//!
//! A message carries a batch of events. The key stream opens with an
//! 8-byte big-endian codec version, then each event contributes one
//! length-prefixed JSON entry to the key stream and one to the value
//! stream (`u64` big-endian length followed by the JSON bytes). Consumers
//! walk both streams in lockstep.

use crate::codec::{Encoder, EncoderResult};
use crate::model::{Column, DdlEvent, RowChangedEvent, RowOperation};
use crate::Result;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Codec version written at the head of every key stream.
pub const BATCH_VERSION: u64 = 1;

/// Event kind carried in the message key.
pub mod message_type {
    pub const ROW: u8 = 1;
    pub const DDL: u8 = 2;
    pub const RESOLVED: u8 = 3;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageKey {
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
}

#[derive(Serialize)]
struct RowPayload<'a> {
    op: &'a RowOperation,
    columns: &'a [Column],
}

#[derive(Serialize)]
struct DdlPayload<'a> {
    query: &'a str,
}

/// Batch encoder for the default protocol.
pub struct JsonBatchEncoder {
    key_buf: BytesMut,
    value_buf: BytesMut,
}

impl JsonBatchEncoder {
    pub fn new() -> Self {
        let mut key_buf = BytesMut::new();
        key_buf.put_u64(BATCH_VERSION);
        Self {
            key_buf,
            value_buf: BytesMut::new(),
        }
    }

    fn append_entry(&mut self, key: &MessageKey, value: &[u8]) -> Result<()> {
        let key_bytes = serde_json::to_vec(key)?;
        self.key_buf.put_u64(key_bytes.len() as u64);
        self.key_buf.put_slice(&key_bytes);
        self.value_buf.put_u64(value.len() as u64);
        self.value_buf.put_slice(value);
        Ok(())
    }
}

impl Default for JsonBatchEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Encoder for JsonBatchEncoder {
    async fn append_row(&mut self, row: &RowChangedEvent) -> Result<EncoderResult> {
        let key = MessageKey {
            ts: row.commit_ts,
            schema: Some(row.table.schema.clone()),
            table: Some(row.table.table.clone()),
            kind: message_type::ROW,
        };
        let value = serde_json::to_vec(&RowPayload {
            op: &row.op,
            columns: &row.columns,
        })?;
        self.append_entry(&key, &value)?;
        Ok(EncoderResult::NoOp)
    }

    async fn append_ddl(&mut self, ddl: &DdlEvent) -> Result<EncoderResult> {
        let key = MessageKey {
            ts: ddl.commit_ts,
            schema: Some(ddl.table.schema.clone()),
            table: Some(ddl.table.table.clone()),
            kind: message_type::DDL,
        };
        let value = serde_json::to_vec(&DdlPayload { query: &ddl.query })?;
        self.append_entry(&key, &value)?;
        Ok(EncoderResult::NeedSyncWrite)
    }

    async fn append_resolved(&mut self, ts: u64) -> Result<EncoderResult> {
        let key = MessageKey {
            ts,
            schema: None,
            table: None,
            kind: message_type::RESOLVED,
        };
        self.append_entry(&key, &[])?;
        Ok(EncoderResult::NeedSyncWrite)
    }

    fn size(&self) -> usize {
        self.key_buf.len() + self.value_buf.len()
    }

    fn build(&mut self) -> (Bytes, Bytes) {
        let key = self.key_buf.split().freeze();
        let value = self.value_buf.split().freeze();
        self.key_buf.put_u64(BATCH_VERSION);
        (key, value)
    }
}

/// Splits a key stream back into its JSON entries. Used by consumers and
/// by tests to assert on what a message carries.
pub fn decode_key_entries(key: &[u8]) -> Result<Vec<MessageKey>> {
    let mut entries = Vec::new();
    let mut rest = key.get(8..).unwrap_or_default();
    while rest.len() >= 8 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&rest[..8]);
        let len = u64::from_be_bytes(prefix) as usize;
        rest = &rest[8..];
        let entry = rest
            .get(..len)
            .ok_or_else(|| crate::Error::Encode("truncated key stream entry".to_string()))?;
        entries.push(serde_json::from_slice(entry)?);
        rest = &rest[len..];
    }
    Ok(entries)
}
