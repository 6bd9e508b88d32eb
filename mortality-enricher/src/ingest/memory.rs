//! In-process message log, used by tests and local runs without a broker.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::cursor::{Cursor, OffsetMap};
use crate::ingest::error::IngestError;
use crate::ingest::source::MessageSource;
use crate::ingest::types::{Partition, SourceMessage, StartingPoint};

#[derive(Default)]
struct LogState {
    partitions: BTreeMap<i32, Vec<Option<Vec<u8>>>>,
    injected_errors: VecDeque<IngestError>,
    committed: OffsetMap,
    commit_calls: usize,
    closed: bool,
}

/// An append-only, partitioned log shared between a producer (the test) and
/// any number of [`MemorySource`] readers. Offsets are indexes into the
/// partition's message list.
#[derive(Clone)]
pub struct MemoryLog {
    topic: Arc<str>,
    state: Arc<Mutex<LogState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl MemoryLog {
    pub fn new(topic: &str) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            topic: Arc::from(topic),
            state: Arc::new(Mutex::new(LogState::default())),
            changes: Arc::new(changes),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a payload and return its offset.
    pub fn append(&self, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.push(partition, Some(payload.into()))
    }

    /// Append a message without payload (a tombstone).
    pub fn append_empty(&self, partition: i32) -> i64 {
        self.push(partition, None)
    }

    /// Make the next `next_message` call of any reader fail with `error`.
    pub fn inject_error(&self, error: IngestError) {
        self.lock().injected_errors.push_back(error);
        self.notify();
    }

    /// Mark the end of the stream: readers drain what is left and then see `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify();
    }

    /// Offsets committed by readers so far, merged across commit calls.
    pub fn committed(&self) -> OffsetMap {
        self.lock().committed.clone()
    }

    pub fn commit_calls(&self) -> usize {
        self.lock().commit_calls
    }

    pub fn len(&self, partition: i32) -> usize {
        self.lock().partitions.get(&partition).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, partition: i32) -> bool {
        self.len(partition) == 0
    }

    /// A new unsubscribed reader over this log.
    pub fn source(&self) -> MemorySource {
        MemorySource {
            log: self.clone(),
            changes: self.changes.subscribe(),
            assignment: None,
        }
    }

    fn push(&self, partition: i32, payload: Option<Vec<u8>>) -> i64 {
        let offset = {
            let mut state = self.lock();
            let messages = state.partitions.entry(partition).or_default();
            messages.push(payload);
            messages.len() - 1
        };
        self.notify();
        i64::try_from(offset).unwrap_or(i64::MAX)
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        // state stays consistent even if a holder panicked mid-test
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Assignment {
    partition: i32,
    position: usize,
}

pub struct MemorySource {
    log: MemoryLog,
    changes: watch::Receiver<u64>,
    assignment: Option<Assignment>,
}

enum Poll {
    Ready(Result<SourceMessage, IngestError>),
    Ended,
    Pending,
}

impl MemorySource {
    fn try_next(&mut self) -> Poll {
        let mut state = self.log.lock();
        if let Some(error) = state.injected_errors.pop_front() {
            return Poll::Ready(Err(error));
        }

        let Some(assignment) = self.assignment.as_mut() else {
            return Poll::Ready(Err(IngestError::fatal(anyhow!(
                "memory source polled before subscribe"
            ))));
        };

        let next = state
            .partitions
            .get(&assignment.partition)
            .and_then(|messages| messages.get(assignment.position))
            .cloned();

        match next {
            Some(payload) => {
                let offset = i64::try_from(assignment.position).unwrap_or(i64::MAX);
                assignment.position += 1;
                Poll::Ready(Ok(SourceMessage::new(
                    Partition::new(self.log.topic().to_string(), assignment.partition),
                    offset,
                    payload,
                )))
            }
            None if state.closed => Poll::Ended,
            None => Poll::Pending,
        }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn subscribe(
        &mut self,
        topic: &str,
        partition: i32,
        start: StartingPoint,
    ) -> Result<(), IngestError> {
        if topic != self.log.topic() {
            return Err(IngestError::Subscribe {
                topic: topic.to_string(),
                partition,
                source: anyhow!("memory log only holds topic '{}'", self.log.topic()),
            });
        }

        let position = match start {
            StartingPoint::Earliest => 0,
            StartingPoint::Latest => self.log.len(partition),
            StartingPoint::Resume(next) => usize::try_from(next).unwrap_or(0),
        };
        self.assignment = Some(Assignment {
            partition,
            position,
        });
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<SourceMessage, IngestError>> {
        loop {
            self.changes.borrow_and_update();
            match self.try_next() {
                Poll::Ready(result) => return Some(result),
                Poll::Ended => return None,
                Poll::Pending => {}
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn commit(&mut self, cursor: &Cursor) -> Result<(), IngestError> {
        let mut state = self.log.lock();
        state.commit_calls += 1;
        for (&partition, &offset) in cursor.offsets() {
            let entry = state.committed.entry(partition).or_insert(offset);
            *entry = (*entry).max(offset);
        }
        Ok(())
    }
}
