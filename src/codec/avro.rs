//! Avro wire protocol with Confluent Schema Registry integration.
//!
//! Messages are framed in the Confluent wire format: a `0x00` magic byte,
//! the registered schema id as a 4-byte big-endian integer, then the Avro
//! binary body. Schemas are derived from the row's columns and registered
//! lazily on first use; registration results are cached per schema
//! fingerprint so steady-state appends never touch the registry.

use crate::codec::{Encoder, EncoderResult};
use crate::model::{Column, DdlEvent, RowChangedEvent, TableName};
use crate::{Error, Result};
use apache_avro::types::Value as AvroValue;
use apache_avro::{to_avro_datum, Schema};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;
use url::Url;

const CONFLUENT_MAGIC: u8 = 0x00;

#[derive(Serialize)]
struct RegisterSchemaRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterSchemaResponse {
    id: u32,
}

/// Registers schemas against a Confluent-compatible registry and caches
/// the assigned ids.
///
/// One manager handles one side of the message (subject suffix `-key` or
/// `-value`); the Avro encoder factory closes over a pair of them.
#[derive(Debug)]
pub struct SchemaManager {
    client: reqwest::Client,
    base_url: String,
    subject_suffix: String,
    ids: tokio::sync::Mutex<HashMap<u64, u32>>,
}

impl SchemaManager {
    /// # Errors
    ///
    /// Returns `Error::Config` if the registry URL is malformed.
    pub fn new(registry_url: &str, subject_suffix: &str) -> Result<Self> {
        Url::parse(registry_url)
            .map_err(|e| Error::Config(format!("invalid registry URL {registry_url}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: registry_url.trim_end_matches('/').to_string(),
            subject_suffix: subject_suffix.to_string(),
            ids: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Subject under which schemas for `topic` are registered.
    pub fn subject(&self, topic: &str) -> String {
        format!("{topic}{}", self.subject_suffix)
    }

    /// Returns the registry id for `schema_json`, registering it under the
    /// topic subject on first sight.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` when the registry is unreachable or rejects
    /// the schema.
    pub async fn register(&self, topic: &str, schema_json: &str) -> Result<u32> {
        let fingerprint = fingerprint(schema_json);
        let mut ids = self.ids.lock().await;
        if let Some(id) = ids.get(&fingerprint) {
            return Ok(*id);
        }

        let subject = self.subject(topic);
        let url = format!("{}/subjects/{subject}/versions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/vnd.schemaregistry.v1+json")
            .json(&RegisterSchemaRequest {
                schema: schema_json,
            })
            .send()
            .await
            .map_err(|e| Error::Schema(format!("registry unreachable at {url}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Schema(format!(
                "registry rejected schema for subject {subject}: {status} {body}"
            )));
        }

        let registered: RegisterSchemaResponse = response
            .json()
            .await
            .map_err(|e| Error::Schema(format!("invalid registry response: {e}")))?;
        debug!(subject = %subject, id = registered.id, "registered avro schema");
        ids.insert(fingerprint, registered.id);
        Ok(registered.id)
    }
}

fn fingerprint(schema_json: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    schema_json.hash(&mut hasher);
    hasher.finish()
}

/// Avro encoder: one row per message, keys from the handle-key columns,
/// values from all columns.
///
/// DDL and resolved markers are not representable on an Avro topic;
/// consumers track schema changes through the registry instead, so both
/// appends report [`EncoderResult::NoOp`].
pub struct AvroEncoder {
    topic: String,
    key_manager: Arc<SchemaManager>,
    value_manager: Arc<SchemaManager>,
    pending_key: Bytes,
    pending_value: Bytes,
}

impl AvroEncoder {
    pub fn new(
        topic: String,
        key_manager: Arc<SchemaManager>,
        value_manager: Arc<SchemaManager>,
    ) -> Self {
        Self {
            topic,
            key_manager,
            value_manager,
            pending_key: Bytes::new(),
            pending_value: Bytes::new(),
        }
    }

    async fn encode_side(
        &self,
        manager: &SchemaManager,
        table: &TableName,
        columns: &[&Column],
    ) -> Result<Bytes> {
        let schema_json = record_schema_json(table, columns);
        let id = manager.register(&self.topic, &schema_json).await?;
        let body = encode_record(&schema_json, columns)?;
        Ok(confluent_frame(id, &body))
    }
}

#[async_trait]
impl Encoder for AvroEncoder {
    async fn append_row(&mut self, row: &RowChangedEvent) -> Result<EncoderResult> {
        let handle_columns: Vec<&Column> = row.handle_key_columns().collect();
        if handle_columns.is_empty() {
            return Err(Error::Encode(format!(
                "table {} has no handle key, cannot build an avro message key",
                row.table
            )));
        }
        let all_columns: Vec<&Column> = row.columns.iter().collect();

        self.pending_key = self
            .encode_side(&self.key_manager, &row.table, &handle_columns)
            .await?;
        self.pending_value = self
            .encode_side(&self.value_manager, &row.table, &all_columns)
            .await?;

        // Every row is its own message; hand it to the producer right away.
        Ok(EncoderResult::NeedAsyncWrite)
    }

    async fn append_ddl(&mut self, ddl: &DdlEvent) -> Result<EncoderResult> {
        debug!(table = %ddl.table, "avro encoder skips ddl event");
        Ok(EncoderResult::NoOp)
    }

    async fn append_resolved(&mut self, ts: u64) -> Result<EncoderResult> {
        debug!(resolved_ts = ts, "avro encoder skips resolved event");
        Ok(EncoderResult::NoOp)
    }

    fn size(&self) -> usize {
        self.pending_key.len() + self.pending_value.len()
    }

    fn build(&mut self) -> (Bytes, Bytes) {
        (
            std::mem::take(&mut self.pending_key),
            std::mem::take(&mut self.pending_value),
        )
    }
}

/// Derives a nullable-union Avro record schema from column values.
fn record_schema_json(table: &TableName, columns: &[&Column]) -> String {
    let fields: Vec<serde_json::Value> = columns
        .iter()
        .map(|column| {
            serde_json::json!({
                "name": avro_name(&column.name),
                "type": ["null", avro_type(&column.value)],
                "default": null,
            })
        })
        .collect();
    serde_json::json!({
        "type": "record",
        "name": avro_name(&format!("{}_{}", table.schema, table.table)),
        "fields": fields,
    })
    .to_string()
}

fn encode_record(schema_json: &str, columns: &[&Column]) -> Result<Vec<u8>> {
    let schema = Schema::parse_str(schema_json)
        .map_err(|e| Error::Encode(format!("invalid derived avro schema: {e}")))?;
    let fields = columns
        .iter()
        .map(|column| (avro_name(&column.name), avro_value(&column.value)))
        .collect();
    to_avro_datum(&schema, AvroValue::Record(fields))
        .map_err(|e| Error::Encode(format!("avro encoding failed: {e}")))
}

fn confluent_frame(schema_id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(CONFLUENT_MAGIC);
    buf.put_u32(schema_id);
    buf.put_slice(body);
    buf.freeze()
}

/// Avro names may only contain `[A-Za-z0-9_]` and must not start with a
/// digit.
fn avro_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn avro_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "long",
        serde_json::Value::Number(_) => "double",
        // Nulls carry no type information; arrays and objects travel as
        // JSON text.
        _ => "string",
    }
}

fn avro_value(value: &serde_json::Value) -> AvroValue {
    let inner = match value {
        serde_json::Value::Null => return AvroValue::Union(0, Box::new(AvroValue::Null)),
        serde_json::Value::Bool(b) => AvroValue::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AvroValue::Long(i)
            } else if let Some(u) = n.as_u64() {
                AvroValue::Long(u as i64)
            } else {
                AvroValue::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => AvroValue::String(s.clone()),
        other => AvroValue::String(other.to_string()),
    };
    AvroValue::Union(1, Box::new(inner))
}
