use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::cursor::Cursor;
use crate::event::EnrichedRecord;

/// One batch to make durable, together with the cursor it advances to.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub sequence: u64,
    pub records: &'a [EnrichedRecord],
    pub cursor: &'a Cursor,
}

/// Last durable position found by [`BatchStorage::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredState {
    pub sequence: u64,
    pub cursor: Cursor,
}

/// Durable output medium for enriched batches.
///
/// `commit` must make the records and the cursor durable together: after a
/// crash at any point, `restore` returns either the state before the call or
/// the state after it, never records without their cursor.
#[async_trait]
pub trait BatchStorage: Send {
    /// Find the last committed batch for `topic` and discard any output that
    /// was written but never committed.
    async fn restore(&mut self, topic: &str) -> Result<Option<RestoredState>, StorageError>;

    /// Write `request.records` and record `request.cursor` atomically.
    /// Re-committing the same sequence after a failure must be safe.
    async fn commit(&mut self, request: CommitRequest<'_>) -> Result<(), StorageError>;
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// Temporary failure (interrupted call, timeout); the commit can be retried
    #[error("transient storage failure: {context}")]
    Transient {
        context: String,
        source: anyhow::Error,
    },

    /// Failure retrying will not fix (permissions, full disk, crashed writer)
    #[error("storage failure: {context}")]
    Fatal {
        context: String,
        source: anyhow::Error,
    },

    #[error("output schema mismatch: {0}")]
    Schema(String),

    #[error("corrupt commit record {path}")]
    CorruptCommitRecord {
        path: String,
        source: serde_json::Error,
    },

    #[error("commit record belongs to topic '{found}', expected '{expected}'")]
    TopicMismatch { expected: String, found: String },
}

impl StorageError {
    /// Classify an I/O error by its kind.
    pub fn from_io(context: impl Into<String>, error: io::Error) -> Self {
        let context = context.into();
        match error.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => StorageError::Transient {
                context,
                source: error.into(),
            },
            _ => StorageError::Fatal {
                context,
                source: error.into(),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            StorageError::Transient { .. } => "transient",
            StorageError::Fatal { .. } => "fatal",
            StorageError::Schema(_) => "schema",
            StorageError::CorruptCommitRecord { .. } => "corrupt_commit_record",
            StorageError::TopicMismatch { .. } => "topic_mismatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_classified_by_kind() {
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(StorageError::from_io("writing", interrupted).is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "read only");
        let err = StorageError::from_io("writing", denied);
        assert!(!err.is_transient());
        assert_eq!(err.error_type(), "fatal");
    }
}
