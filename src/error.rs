use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema registry error: {0}")]
    Schema(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("DDL event ignored by filter")]
    DdlIgnored,
}

impl Error {
    /// Whether this error is a quiet cancellation exit rather than a failure.
    /// Cancellation is never forwarded to the shared error channel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
