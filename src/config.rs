//! Sink configuration parsed from a sink URI.
//!
//! The sink is addressed by a URI of the form
//! `kafka://broker:9092/topic?partition-num=6&protocol=avro`. The scheme
//! selects the MQ driver, the path names the topic, and query parameters
//! tune the producer. Anything the URI cannot carry (schema registry URL)
//! arrives through the `opts` map handed to the sink constructor.

use crate::dispatcher::DispatchRule;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Default capacity of each partition's input channel. Sized so a slow
/// partition applies backpressure to the upstream emitter well before
/// memory becomes a concern.
pub const DEFAULT_PARTITION_CHANNEL_SIZE: usize = 12_800;

/// MQ driver selected by the sink URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkScheme {
    Kafka,
    KafkaSsl,
    Pulsar,
    PulsarSsl,
}

impl SinkScheme {
    pub fn parse(scheme: &str) -> Result<Self> {
        match scheme.to_lowercase().as_str() {
            "kafka" => Ok(SinkScheme::Kafka),
            "kafka+ssl" => Ok(SinkScheme::KafkaSsl),
            "pulsar" => Ok(SinkScheme::Pulsar),
            "pulsar+ssl" => Ok(SinkScheme::PulsarSsl),
            other => Err(Error::Config(format!(
                "can't create MQ sink with unsupported scheme: {other}"
            ))),
        }
    }

    pub fn is_kafka(&self) -> bool {
        matches!(self, SinkScheme::Kafka | SinkScheme::KafkaSsl)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, SinkScheme::KafkaSsl | SinkScheme::PulsarSsl)
    }
}

/// Wire protocol spoken on the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Default,
    Canal,
    Avro,
}

impl Protocol {
    /// Resolves a protocol name. Unknown names degrade to the default
    /// protocol with a warning rather than failing the sink.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "" | "default" => Protocol::Default,
            "canal" => Protocol::Canal,
            "avro" => Protocol::Avro,
            other => {
                warn!(protocol = other, "unknown sink protocol, using default");
                Protocol::Default
            }
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Default => write!(f, "default"),
            Protocol::Canal => write!(f, "canal"),
            Protocol::Avro => write!(f, "avro"),
        }
    }
}

/// TLS material paths for `kafka+ssl` endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsCredential {
    pub ca_path: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl TlsCredential {
    pub fn is_empty(&self) -> bool {
        self.ca_path.is_none() && self.cert_path.is_none() && self.key_path.is_none()
    }
}

/// Parsed sink configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub scheme: SinkScheme,
    /// Broker endpoint, the URI authority.
    pub endpoints: String,
    /// Topic name, the URI path with the leading `/` stripped.
    pub topic: String,
    /// Overrides the partition count discovered from the broker.
    pub partition_num: Option<i32>,
    /// Replication factor used when the topic is auto-created.
    pub replication_factor: i16,
    pub kafka_version: Option<String>,
    pub max_message_bytes: Option<usize>,
    pub compression: String,
    pub client_id: Option<String>,
    pub protocol: Protocol,
    pub credential: TlsCredential,
    /// Partition routing rules, first match wins. Empty means every row
    /// takes the default routing kind.
    pub dispatch_rules: Vec<DispatchRule>,
    /// Capacity of each partition's input channel.
    pub partition_channel_size: usize,
}

impl SinkConfig {
    /// Parses a sink URI.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown scheme, a missing host or
    /// topic, or an unparsable numeric parameter.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url =
            Url::parse(uri).map_err(|e| Error::Config(format!("invalid sink URI {uri}: {e}")))?;
        let scheme = SinkScheme::parse(url.scheme())?;

        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("sink URI {uri} has no host")))?;
        let endpoints = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let topic = url.path().trim_matches('/').to_string();
        if topic.is_empty() {
            return Err(Error::Config(format!("sink URI {uri} has no topic path")));
        }

        let mut config = SinkConfig {
            scheme,
            endpoints,
            topic,
            partition_num: None,
            replication_factor: 1,
            kafka_version: None,
            max_message_bytes: None,
            compression: "none".to_string(),
            client_id: None,
            protocol: Protocol::Default,
            credential: TlsCredential::default(),
            dispatch_rules: Vec::new(),
            partition_channel_size: DEFAULT_PARTITION_CHANNEL_SIZE,
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "partition-num" => {
                    let n: i32 = parse_num(&key, &value)?;
                    if n <= 0 {
                        return Err(Error::Config(format!(
                            "partition-num must be positive, got {n}"
                        )));
                    }
                    config.partition_num = Some(n);
                }
                "replication-factor" => config.replication_factor = parse_num(&key, &value)?,
                "kafka-version" => config.kafka_version = Some(value.to_string()),
                "max-message-bytes" => config.max_message_bytes = Some(parse_num(&key, &value)?),
                "compression" => config.compression = value.to_string(),
                "kafka-client-id" => config.client_id = Some(value.to_string()),
                "protocol" => config.protocol = Protocol::from_name(&value),
                "ca" => config.credential.ca_path = Some(value.to_string()),
                "cert" => config.credential.cert_path = Some(value.to_string()),
                "key" => config.credential.key_path = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(config)
    }

    /// Installs partition routing rules.
    pub fn with_dispatch_rules(mut self, rules: Vec<DispatchRule>) -> Self {
        self.dispatch_rules = rules;
        self
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}
