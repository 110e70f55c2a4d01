use thiserror::Error;

/// Failures surfaced by the ingestion pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The dump cannot be opened or read
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// One record could not be parsed or extracted
    #[error("malformed record #{position}: {reason}")]
    MalformedRecord { position: u64, reason: String },

    /// Transient sink failure (connectivity, timeout)
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    /// The sink refused the data
    #[error("sink rejected batch: {0}")]
    SinkRejected(String),

    #[error("ingestion cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::SinkUnavailable(_))
    }

    pub fn is_per_record(&self) -> bool {
        matches!(self, IngestError::MalformedRecord { .. })
    }
}

/// Errors reported by a [`GraphSink`](crate::sink::GraphSink)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Rejected(String),
}

impl From<SinkError> for IngestError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Unavailable(msg) => IngestError::SinkUnavailable(msg),
            SinkError::Rejected(msg) => IngestError::SinkRejected(msg),
        }
    }
}
