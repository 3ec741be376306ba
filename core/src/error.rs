//! Error types shared by the pipeline stages.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures of the entity extractor. All of them are retryable.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The extractor itself reported an error.
    #[error("extractor failed: {0}")]
    Failed(String),

    /// The extraction did not finish within the configured timeout.
    #[error("extraction timed out after {0:?}")]
    TimedOut(Duration),

    /// The blocking extraction task panicked or was cancelled.
    #[error("extraction task aborted: {0}")]
    Panicked(String),

    /// A gazetteer file could not be loaded.
    #[error("invalid gazetteer: {0}")]
    Gazetteer(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("entity extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    /// A message could not be decoded into the record shape its channel carries.
    #[error("malformed record on {topic}: {message}")]
    MalformedRecord { topic: String, message: String },

    #[error("state store error: {0}")]
    Storage(#[from] sled::Error),

    #[error("state encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("channel {0} is closed")]
    ChannelClosed(String),

    /// A partition worker panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl PipelineError {
    pub(crate) fn malformed(topic: &str, message: impl Into<String>) -> Self {
        Self::MalformedRecord { topic: topic.to_string(), message: message.into() }
    }

    /// Only extraction failures are redelivered; everything else is either
    /// dropped (malformed input) or stops the partition worker.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Extraction(_))
    }
}
