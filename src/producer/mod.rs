//! MQ producer drivers.
//!
//! The sink talks to the message queue through [`MqProducer`], a narrow
//! capability set any driver can implement. The Kafka driver ships in
//! [`kafka`]; other drivers (Pulsar) plug in from outside the crate.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub mod kafka;

pub use kafka::KafkaProducer;

/// Driver capability set.
#[async_trait]
pub trait MqProducer: Send + Sync {
    /// Partition count of the target topic; fixed over the producer's
    /// lifetime.
    fn partition_num(&self) -> i32;

    /// Hands a message to the driver for the given partition. Returns once
    /// the driver has accepted the message; durable acknowledgement is
    /// deferred to [`MqProducer::flush`].
    async fn send_message(&self, key: Bytes, value: Bytes, partition: i32) -> Result<()>;

    /// Sends the message to every partition and returns only when all of
    /// them have acknowledged it.
    async fn sync_broadcast_message(&self, key: Bytes, value: Bytes) -> Result<()>;

    /// Blocks until every previously accepted message is durably
    /// acknowledged.
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
