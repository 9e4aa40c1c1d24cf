//! Wire message encoding.
//!
//! The sink drives encoders through a small capability set: events are
//! appended one at a time, each append reports how urgently the buffered
//! batch must be written out, and [`Encoder::build`] drains the batch into
//! a `(key, value)` message pair. Each partition worker owns exactly one
//! encoder instance at a time and replaces it after every build.

use crate::config::Protocol;
use crate::model::{DdlEvent, RowChangedEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub mod avro;
pub mod json;

pub use avro::{AvroEncoder, SchemaManager};
pub use json::JsonBatchEncoder;

/// What the caller must do with the buffered batch after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderResult {
    /// Keep buffering; the worker decides when to flush.
    NoOp,
    /// Flush through the asynchronous per-partition path.
    NeedAsyncWrite,
    /// Flush now and wait for acknowledgement before continuing.
    NeedSyncWrite,
}

/// Batch encoder capability set.
///
/// `build` is single-shot: it consumes the buffered batch, and the owner
/// is expected to replace the encoder with a fresh instance afterwards.
#[async_trait]
pub trait Encoder: Send {
    async fn append_row(&mut self, row: &RowChangedEvent) -> Result<EncoderResult>;

    async fn append_ddl(&mut self, ddl: &DdlEvent) -> Result<EncoderResult>;

    async fn append_resolved(&mut self, ts: u64) -> Result<EncoderResult>;

    /// Bytes currently buffered across the key and value streams.
    fn size(&self) -> usize;

    /// Drains the buffered batch into a `(key, value)` message pair.
    fn build(&mut self) -> (Bytes, Bytes);
}

/// Produces a fresh encoder for each batch.
pub type EncoderFactory = Arc<dyn Fn() -> Box<dyn Encoder> + Send + Sync>;

/// Builds the encoder factory for a protocol.
///
/// The Avro factory is the default factory decorated with two schema
/// managers, one for message keys and one for values, both bound to the
/// topic subject.
///
/// # Errors
///
/// Returns `Error::Config` when the protocol is `avro` and `opts` carries
/// no `registry` URL, or the URL is malformed.
pub fn new_encoder_factory(
    protocol: Protocol,
    topic: &str,
    opts: &HashMap<String, String>,
) -> Result<EncoderFactory> {
    match protocol {
        Protocol::Default => Ok(Arc::new(|| Box::new(JsonBatchEncoder::new()) as Box<dyn Encoder>)),
        Protocol::Canal => {
            // The canal encoder is not wired in; degrade like an unknown
            // protocol name does.
            warn!("canal protocol is not available, falling back to default");
            Ok(Arc::new(|| Box::new(JsonBatchEncoder::new()) as Box<dyn Encoder>))
        }
        Protocol::Avro => {
            let registry = opts.get("registry").ok_or_else(|| {
                Error::Config("Avro protocol requires parameter \"registry\"".to_string())
            })?;
            let key_manager = Arc::new(SchemaManager::new(registry, "-key")?);
            let value_manager = Arc::new(SchemaManager::new(registry, "-value")?);
            let topic = topic.to_string();
            Ok(Arc::new(move || {
                Box::new(AvroEncoder::new(
                    topic.clone(),
                    key_manager.clone(),
                    value_manager.clone(),
                )) as Box<dyn Encoder>
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factory() {
        let factory = new_encoder_factory(Protocol::Default, "t", &HashMap::new()).unwrap();
        let encoder = factory();
        assert_eq!(encoder.size(), 0);
    }

    #[test]
    fn test_avro_factory_requires_registry() {
        let err = new_encoder_factory(Protocol::Avro, "t", &HashMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_avro_factory_with_registry() {
        let opts = HashMap::from([(
            "registry".to_string(),
            "http://registry.local:8081".to_string(),
        )]);
        let factory = new_encoder_factory(Protocol::Avro, "t", &opts).unwrap();
        let encoder = factory();
        assert_eq!(encoder.size(), 0);
    }

    #[test]
    fn test_avro_factory_rejects_bad_registry_url() {
        let opts = HashMap::from([("registry".to_string(), "not a url".to_string())]);
        let err = new_encoder_factory(Protocol::Avro, "t", &opts).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
