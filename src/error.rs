//! Crate-wide error type.
//!
//! Scoped to what the pipeline core actually throws (see the error handling
//! design: transient transport errors retry in-loop, poison messages and
//! duplicate fingerprints are handled without an `Err`, and only
//! configuration and ClickHouse-rejection failures are fatal).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("key extraction failed for field {path}: {reason}")]
    KeyExtraction { path: String, reason: String },

    #[error("ClickHouse rejected the batch (non-retryable): {0}")]
    ClickHouseFatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Config(msg.into())
    }

    pub fn jetstream(msg: impl Into<String>) -> Self {
        CoreError::JetStream(msg.into())
    }

    pub fn key_extraction(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::KeyExtraction {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors where the in-loop retry policy applies (transient
    /// network failure); false for errors that must surface to the
    /// supervisor's error channel.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Kafka(_) | CoreError::JetStream(_) | CoreError::ClickHouse(_))
    }
}
