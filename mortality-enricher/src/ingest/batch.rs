use crate::cursor::OffsetMap;
use crate::event::RawEvent;
use crate::ingest::decoder::DecodeErrorKind;
use crate::ingest::types::Partition;

/// A decoded record together with its position in the input log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedEvent {
    pub partition: Partition,
    pub offset: i64,
    pub event: RawEvent,
}

/// A message that reached us but could not be turned into a [`RawEvent`].
#[derive(Debug)]
pub struct DecodeError {
    // per-message decode problem, not a consumer error
    kind: DecodeErrorKind,

    // coordinates of the original message so the offset
    // still gets committed with the rest of the batch
    partition: Partition,
    offset: i64,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, partition: Partition, offset: i64) -> Self {
        Self {
            kind,
            partition,
            offset,
        }
    }

    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Result of one `poll_batch` call.
#[derive(Debug, Default)]
pub struct PolledBatch {
    events: Vec<SourcedEvent>,
    errors: Vec<DecodeError>,

    // next offset to consume per partition, covering both
    // decoded and undecodable messages in this batch
    offsets: OffsetMap,

    // set when the shutdown signal cut the poll short
    shutdown_requested: bool,

    // set when the transport reported end of stream
    source_exhausted: bool,
}

impl PolledBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_size_hint(hint: usize) -> Self {
        Self {
            events: Vec::with_capacity(hint),
            ..Self::default()
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Messages taken off the transport, decoded or not.
    pub fn message_count(&self) -> usize {
        self.events.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.errors.is_empty() && self.offsets.is_empty()
    }

    pub fn events(&self) -> &[SourcedEvent] {
        &self.events
    }

    pub fn errors(&self) -> &[DecodeError] {
        &self.errors
    }

    pub fn offsets(&self) -> &OffsetMap {
        &self.offsets
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn source_exhausted(&self) -> bool {
        self.source_exhausted
    }

    pub fn push_event(&mut self, event: SourcedEvent) {
        self.advance(event.partition.partition_number(), event.offset);
        self.events.push(event);
    }

    pub fn push_error(&mut self, error: DecodeError) {
        self.advance(error.partition.partition_number(), error.offset);
        self.errors.push(error);
    }

    pub fn mark_shutdown_requested(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn mark_source_exhausted(&mut self) {
        self.source_exhausted = true;
    }

    // consume this batch and return its contents
    pub fn unpack(self) -> (Vec<SourcedEvent>, Vec<DecodeError>, OffsetMap) {
        (self.events, self.errors, self.offsets)
    }

    fn advance(&mut self, partition: i32, offset: i64) {
        let next = offset + 1;
        self.offsets
            .entry(partition)
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(partition: i32, offset: i64) -> SourcedEvent {
        SourcedEvent {
            partition: Partition::new("hospital_trends".to_string(), partition),
            offset,
            event: RawEvent {
                date: "Jan-24".to_string(),
                setting: "ER".to_string(),
                category: "A".to_string(),
                system: "S".to_string(),
                facility_name: "F".to_string(),
                count: 1,
            },
        }
    }

    #[test]
    fn test_offsets_cover_events_and_errors() {
        let mut batch = PolledBatch::new_with_size_hint(4);
        batch.push_event(event_at(0, 10));
        batch.push_error(DecodeError::new(
            DecodeErrorKind::EmptyPayload,
            Partition::new("hospital_trends".to_string(), 0),
            11,
        ));
        batch.push_event(event_at(1, 3));

        assert_eq!(batch.event_count(), 2);
        assert_eq!(batch.error_count(), 1);
        assert_eq!(batch.message_count(), 3);
        assert_eq!(batch.offsets().get(&0), Some(&12));
        assert_eq!(batch.offsets().get(&1), Some(&4));
    }

    #[test]
    fn test_empty_batch() {
        let batch = PolledBatch::new();
        assert!(batch.is_empty());
        assert!(!batch.shutdown_requested());
    }
}
