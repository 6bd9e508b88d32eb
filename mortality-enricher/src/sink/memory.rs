//! In-memory [`BatchStorage`] with failure injection, for exercising the
//! commit protocol without touching disk.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::event::EnrichedRecord;
use crate::sink::commit_log::{data_file_name, CommitRecord};
use crate::sink::storage::{BatchStorage, CommitRequest, RestoredState, StorageError};

/// A failure to trigger on an upcoming `commit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Fail with a retryable error, writing nothing
    TransientError,
    /// Fail with a non-retryable error, writing nothing
    FatalError,
    /// Die before anything reaches storage
    CrashBeforeDataWrite,
    /// Die after the data is stored but before the commit record is
    CrashAfterDataWrite,
}

#[derive(Default)]
struct StorageState {
    data: BTreeMap<u64, Vec<EnrichedRecord>>,
    commits: BTreeMap<u64, CommitRecord>,
    failures: VecDeque<FailurePoint>,
    commit_calls: usize,
}

/// Shared handle: clones see the same stored batches, so a test can keep one
/// handle while a sink owns another and then "restart" with a third.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure; queued failures fire on consecutive commit calls.
    pub fn inject(&self, failure: FailurePoint) {
        self.lock().failures.push_back(failure);
    }

    /// Records of every committed batch, in sequence order.
    pub fn committed_records(&self) -> Vec<EnrichedRecord> {
        let state = self.lock();
        state
            .commits
            .keys()
            .filter_map(|sequence| state.data.get(sequence))
            .flatten()
            .cloned()
            .collect()
    }

    /// Sequences that have data stored, committed or not.
    pub fn data_sequences(&self) -> Vec<u64> {
        self.lock().data.keys().copied().collect()
    }

    pub fn last_commit(&self) -> Option<CommitRecord> {
        self.lock().commits.values().next_back().cloned()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits.len()
    }

    /// Total `commit` calls, including failed ones.
    pub fn commit_calls(&self) -> usize {
        self.lock().commit_calls
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn simulated(what: &str) -> anyhow::Error {
    anyhow!("simulated {what}")
}

#[async_trait]
impl BatchStorage for MemoryStorage {
    async fn restore(&mut self, topic: &str) -> Result<Option<RestoredState>, StorageError> {
        let mut state = self.lock();
        let committed = state.commits.keys().next_back().copied().unwrap_or(0);
        state.data.retain(|&sequence, _| sequence <= committed);

        match state.commits.values().next_back() {
            Some(record) if record.topic != topic => Err(StorageError::TopicMismatch {
                expected: topic.to_string(),
                found: record.topic.clone(),
            }),
            Some(record) => Ok(Some(RestoredState {
                sequence: record.sequence,
                cursor: record.cursor(),
            })),
            None => Ok(None),
        }
    }

    async fn commit(&mut self, request: CommitRequest<'_>) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.commit_calls += 1;

        match state.failures.pop_front() {
            Some(FailurePoint::TransientError) => {
                return Err(StorageError::Transient {
                    context: format!("committing batch {}", request.sequence),
                    source: simulated("transient failure"),
                })
            }
            Some(FailurePoint::FatalError) => {
                return Err(StorageError::Fatal {
                    context: format!("committing batch {}", request.sequence),
                    source: simulated("fatal failure"),
                })
            }
            Some(FailurePoint::CrashBeforeDataWrite) => {
                return Err(StorageError::Fatal {
                    context: format!("writing batch {}", request.sequence),
                    source: simulated("crash before data write"),
                })
            }
            Some(FailurePoint::CrashAfterDataWrite) => {
                state
                    .data
                    .insert(request.sequence, request.records.to_vec());
                return Err(StorageError::Fatal {
                    context: format!("writing commit record {}", request.sequence),
                    source: simulated("crash after data write"),
                });
            }
            None => {}
        }

        state
            .data
            .insert(request.sequence, request.records.to_vec());
        state.commits.insert(
            request.sequence,
            CommitRecord::new(
                request.sequence,
                request.cursor,
                vec![data_file_name(request.sequence)],
                request.records.len(),
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;

    #[tokio::test]
    async fn test_crash_after_data_write_leaves_orphan_until_restore() {
        let mut storage = MemoryStorage::new();
        let cursor = Cursor::with_offsets("hospital_trends", [(0, 1)].into_iter().collect());
        storage.inject(FailurePoint::CrashAfterDataWrite);

        let err = storage
            .commit(CommitRequest {
                sequence: 1,
                records: &[],
                cursor: &cursor,
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(storage.data_sequences(), vec![1]);
        assert_eq!(storage.commit_count(), 0);

        assert_eq!(storage.restore("hospital_trends").await.unwrap(), None);
        assert!(storage.data_sequences().is_empty());
    }
}
