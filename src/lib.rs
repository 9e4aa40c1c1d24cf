//! # mq-sink
//!
//! A partitioned message-queue sink for change-data-capture streams. The
//! sink ingests ordered row change events and resolved-timestamp markers
//! from an upstream CDC pipeline, encodes them into wire messages,
//! dispatches them across the topic's partitions, and maintains a
//! monotonic checkpoint timestamp the upstream can safely advance its
//! committed watermark to.
//!
//! ## Overview
//!
//! Rows fan out to one worker task per partition over bounded channels;
//! each worker batches events in its own encoder and hands finished
//! messages to the producer. Flushing pushes a resolved-timestamp barrier
//! through every partition: workers flush what they have buffered, publish
//! their progress, and once every partition has caught up the producer is
//! flushed and the checkpoint advances. It provides:
//!
//! - **At-least-once delivery** up to the returned checkpoint timestamp
//! - **Per-row or per-table ordering** via configurable routing rules
//! - **Bounded memory** through channel backpressure and a 4 MiB batch cap
//! - **Pluggable drivers and protocols** behind narrow producer and
//!   encoder traits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mq_sink::filter::{FilterConfig, TableFilter};
//! use mq_sink::{MqSink, Result, SinkConfig};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config =
//!         SinkConfig::from_uri("kafka://localhost:9092/cdc-events?partition-num=4")?;
//!     let filter = Arc::new(TableFilter::new(&FilterConfig::default())?);
//!     let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
//!     let cancel = CancellationToken::new();
//!
//!     let sink = MqSink::kafka(&config, filter, &HashMap::new(), err_tx, &cancel).await?;
//!
//!     // ... emit_row_changed_events(...) as the upstream produces ...
//!
//!     let checkpoint = sink.flush_row_changed_events(42).await?;
//!     println!("checkpoint advanced to {checkpoint}");
//!
//!     sink.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The sink is addressed by a URI; the scheme picks the driver, the path
//! names the topic and query parameters tune the producer:
//!
//! ```text
//! kafka://broker:9092/topic?partition-num=6&replication-factor=3&protocol=avro
//! ```
//!
//! See [`SinkConfig`] for the full parameter list. The Avro protocol
//! additionally needs a `registry` entry in the constructor's `opts` map
//! pointing at a Confluent-compatible schema registry.
//!
//! ## Architecture
//!
//! - [`sink`] - Coordinator, partition workers and the barrier protocol
//! - [`dispatcher`] - Row-to-partition routing rules
//! - [`codec`] - Encoder trait plus the default and Avro protocols
//! - [`producer`] - Producer trait and the Kafka driver
//! - [`filter`] - DML/DDL ignore rules
//! - [`config`] - Sink URI parsing
//! - [`error`] - Error types and handling

/// Wire protocol encoders
pub mod codec;

/// Sink URI parsing and tunables
pub mod config;

/// Row-to-partition routing
pub mod dispatcher;

/// Error types and result handling
pub mod error;

/// Event filtering rules
pub mod filter;

/// Row change and DDL event model
pub mod model;

/// MQ producer drivers
pub mod producer;

/// The sink coordinator and its partition workers
pub mod sink;

pub use config::{Protocol, SinkConfig};
pub use error::{Error, Result};
pub use sink::MqSink;
