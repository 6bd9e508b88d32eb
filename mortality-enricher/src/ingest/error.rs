use thiserror::Error;

/// Transport-level failures. Per-message decode problems are not errors at
/// this level; they travel inside the polled batch.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Recoverable transport hiccup (broker down, timeout); the poll may be retried
    #[error("transient transport error")]
    Transient { source: anyhow::Error },

    /// Unrecoverable transport failure (authentication, fatal consumer error)
    #[error("fatal transport error")]
    Fatal { source: anyhow::Error },

    #[error("failed to subscribe to {topic}:{partition}")]
    Subscribe {
        topic: String,
        partition: i32,
        source: anyhow::Error,
    },

    #[error("failed to commit offsets to the transport")]
    Commit { source: anyhow::Error },
}

impl IngestError {
    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        IngestError::Transient {
            source: source.into(),
        }
    }

    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        IngestError::Fatal {
            source: source.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient { .. })
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            IngestError::Transient { .. } => "transient",
            IngestError::Fatal { .. } => "fatal",
            IngestError::Subscribe { .. } => "subscribe",
            IngestError::Commit { .. } => "commit",
        }
    }
}
