use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cursor::{Cursor, OffsetMap};
use crate::event::EnrichedRecord;
use crate::metrics_consts::{
    SINK_COMMITTED_OFFSET, SINK_COMMIT_DURATION_MS, SINK_COMMIT_FAILURES, SINK_COMMIT_RETRIES,
    SINK_RECORDS_WRITTEN,
};
use crate::sink::storage::{BatchStorage, CommitRequest, StorageError};
use crate::utils::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkRetryConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SinkRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::doubling(Duration::from_millis(100), Duration::from_secs(10)),
        }
    }
}

/// Outcome of a successful [`CheckpointedSink::append_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// The batch and its offsets are durable
    Committed { sequence: u64, records: usize },
    /// No records and no offset movement, nothing was written
    NothingToCommit,
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("failed to restore sink state")]
    Restore { source: StorageError },

    #[error("batch {sequence} failed with a non-retryable storage error")]
    Fatal {
        sequence: u64,
        source: StorageError,
    },

    #[error("batch {sequence} still failing after {attempts} attempts")]
    RetriesExhausted {
        sequence: u64,
        attempts: u32,
        source: StorageError,
    },
}

impl WriteError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            WriteError::Restore { .. } => "restore",
            WriteError::Fatal { .. } => "fatal",
            WriteError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Appends enriched batches to storage and owns the input cursor.
///
/// The cursor only moves after storage acknowledged the batch that carries
/// it, so a restart always resumes right after the last durable batch.
pub struct CheckpointedSink<B> {
    storage: B,
    cursor: Cursor,
    next_sequence: u64,
    retry: SinkRetryConfig,
}

impl<B: BatchStorage> CheckpointedSink<B> {
    /// Restore the cursor from `storage`, discarding uncommitted output.
    pub async fn open(mut storage: B, topic: &str, retry: SinkRetryConfig) -> Result<Self, WriteError> {
        let restored = storage
            .restore(topic)
            .await
            .map_err(|source| WriteError::Restore { source })?;

        let (cursor, next_sequence) = match restored {
            Some(state) => (state.cursor, state.sequence + 1),
            None => (Cursor::new(topic), 1),
        };
        info!(
            topic = topic,
            next_sequence = next_sequence,
            offsets = ?cursor.offsets(),
            "Opened checkpointed sink"
        );

        Ok(Self {
            storage,
            cursor,
            next_sequence,
            retry,
        })
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    /// Durably append `records` and advance the cursor by `offsets`.
    ///
    /// Batches without records are still committed when they move the cursor,
    /// so offsets of dropped messages are not re-read after a restart.
    pub async fn append_batch(
        &mut self,
        records: &[EnrichedRecord],
        offsets: &OffsetMap,
    ) -> Result<Ack, WriteError> {
        if records.is_empty() && !self.cursor.would_advance(offsets) {
            return Ok(Ack::NothingToCommit);
        }

        let candidate = self.cursor.advanced(offsets);
        let sequence = self.next_sequence;
        let mut attempt: u32 = 0;

        loop {
            let start = Instant::now();
            let result = self
                .storage
                .commit(CommitRequest {
                    sequence,
                    records,
                    cursor: &candidate,
                })
                .await;

            match result {
                Ok(()) => {
                    metrics::histogram!(SINK_COMMIT_DURATION_MS)
                        .record(start.elapsed().as_millis() as f64);
                    metrics::counter!(SINK_RECORDS_WRITTEN).increment(records.len() as u64);
                    for (partition, offset) in candidate.offsets() {
                        metrics::gauge!(SINK_COMMITTED_OFFSET, "partition" => partition.to_string())
                            .set(*offset as f64);
                    }
                    debug!(
                        sequence = sequence,
                        records = records.len(),
                        attempts = attempt + 1,
                        "Batch committed"
                    );

                    self.cursor = candidate;
                    self.next_sequence += 1;
                    return Ok(Ack::Committed {
                        sequence,
                        records: records.len(),
                    });
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff.next_delay(attempt);
                    attempt += 1;
                    warn!(
                        sequence = sequence,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = ?e,
                        "Transient storage error, retrying commit"
                    );
                    metrics::counter!(SINK_COMMIT_RETRIES).increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    error!(sequence = sequence, error = ?e, "Commit retries exhausted");
                    metrics::counter!(SINK_COMMIT_FAILURES, "error" => "retries_exhausted")
                        .increment(1);
                    return Err(WriteError::RetriesExhausted {
                        sequence,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => {
                    error!(sequence = sequence, error = ?e, "Non-retryable storage error");
                    metrics::counter!(SINK_COMMIT_FAILURES, "error" => e.error_type()).increment(1);
                    return Err(WriteError::Fatal {
                        sequence,
                        source: e,
                    });
                }
            }
        }
    }
}
