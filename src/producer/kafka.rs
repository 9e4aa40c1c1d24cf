//! Kafka driver built on rdkafka's `FutureProducer`.

use crate::config::SinkConfig;
use crate::producer::MqProducer;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{error, info};

/// Partition count used when the topic must be created and the sink URI
/// carries no `partition-num` override.
const DEFAULT_PARTITION_NUM: i32 = 4;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    partition_num: i32,
    delivery_timeout: Duration,
}

impl KafkaProducer {
    /// Connects to the brokers, ensures the topic exists and resolves the
    /// partition count.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when `partition-num` exceeds the partition
    /// count of an existing topic, and `Error::Kafka` for driver failures.
    pub async fn new(config: &SinkConfig) -> Result<Self> {
        let client_config = build_client_config(config);

        let producer: FutureProducer = client_config.create().map_err(|e| {
            error!("failed to create Kafka producer: {}", e);
            Error::Kafka(e)
        })?;

        let partition_num = ensure_topic(config).await?;
        info!(
            topic = %config.topic,
            partition_num,
            "Kafka producer ready"
        );

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            partition_num,
            delivery_timeout: Duration::from_secs(30),
        })
    }
}

fn build_client_config(config: &SinkConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.endpoints)
        .set("compression.type", &config.compression)
        .set("acks", "all")
        .set("message.timeout.ms", "30000")
        .set("request.timeout.ms", "20000")
        .set("retries", "3")
        .set("retry.backoff.ms", "100")
        .set("enable.idempotence", "true");

    if let Some(client_id) = &config.client_id {
        client_config.set("client.id", client_id);
    }
    if let Some(max_bytes) = config.max_message_bytes {
        client_config.set("message.max.bytes", max_bytes.to_string());
    }
    if config.scheme.is_tls() {
        client_config.set("security.protocol", "ssl");
        if let Some(ca) = &config.credential.ca_path {
            client_config.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &config.credential.cert_path {
            client_config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &config.credential.key_path {
            client_config.set("ssl.key.location", key);
        }
    }
    client_config
}

/// Creates the topic if it is missing and returns the partition count the
/// sink will fan out over.
async fn ensure_topic(config: &SinkConfig) -> Result<i32> {
    let admin: AdminClient<DefaultClientContext> = build_client_config(config)
        .create()
        .map_err(Error::Kafka)?;

    let metadata = admin
        .inner()
        .fetch_metadata(Some(&config.topic), METADATA_TIMEOUT)
        .map_err(Error::Kafka)?;

    let existing = metadata
        .topics()
        .iter()
        .find(|t| t.name() == config.topic)
        .map(|t| t.partitions().len() as i32)
        .filter(|&n| n > 0);

    if let Some(actual) = existing {
        let partition_num = match config.partition_num {
            Some(requested) if requested > actual => {
                return Err(Error::Config(format!(
                    "partition-num {requested} exceeds the {actual} partitions of topic {}",
                    config.topic
                )));
            }
            Some(requested) => requested,
            None => actual,
        };
        return Ok(partition_num);
    }

    let partition_num = config.partition_num.unwrap_or(DEFAULT_PARTITION_NUM);
    info!(
        topic = %config.topic,
        partition_num,
        replication_factor = config.replication_factor,
        "creating topic"
    );
    let new_topic = NewTopic::new(
        &config.topic,
        partition_num,
        TopicReplication::Fixed(i32::from(config.replication_factor)),
    );
    let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));
    let results = admin
        .create_topics(&[new_topic], &opts)
        .await
        .map_err(Error::Kafka)?;
    for result in results {
        if let Err((topic, code)) = result {
            return Err(Error::Producer(format!(
                "failed to create topic {topic}: {code}"
            )));
        }
    }
    Ok(partition_num)
}

#[async_trait]
impl MqProducer for KafkaProducer {
    fn partition_num(&self) -> i32 {
        self.partition_num
    }

    async fn send_message(&self, key: Bytes, value: Bytes, partition: i32) -> Result<()> {
        let record = FutureRecord::to(&self.topic)
            .partition(partition)
            .key(key.as_ref())
            .payload(value.as_ref());

        match tokio::time::timeout(
            self.delivery_timeout,
            self.producer.send(record, rdkafka::util::Timeout::Never),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _message))) => {
                error!(partition, "failed to deliver message: {}", e);
                Err(Error::Kafka(e))
            }
            Err(_) => Err(Error::Producer(format!(
                "message delivery to partition {partition} timed out after {:?}",
                self.delivery_timeout
            ))),
        }
    }

    async fn sync_broadcast_message(&self, key: Bytes, value: Bytes) -> Result<()> {
        let sends = (0..self.partition_num)
            .map(|partition| self.send_message(key.clone(), value.clone(), partition));
        try_join_all(sends).await?;
        self.flush().await
    }

    async fn flush(&self) -> Result<()> {
        self.producer.flush(self.delivery_timeout).map_err(|e| {
            error!("failed to flush producer: {}", e);
            Error::Kafka(e)
        })
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}
