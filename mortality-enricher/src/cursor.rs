//! Durable progress marker for the input stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Partition number -> next offset to consume.
pub type OffsetMap = BTreeMap<i32, i64>;

/// Per-partition resume point for one topic.
///
/// Offsets stored here are always "next offset to consume" (last processed + 1),
/// matching what Kafka expects on commit. A cursor only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cursor {
    topic: String,
    offsets: OffsetMap,
}

impl Cursor {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            offsets: OffsetMap::new(),
        }
    }

    pub fn with_offsets(topic: impl Into<String>, offsets: OffsetMap) -> Self {
        Self {
            topic: topic.into(),
            offsets,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn offsets(&self) -> &OffsetMap {
        &self.offsets
    }

    pub fn next_offset(&self, partition: i32) -> Option<i64> {
        self.offsets.get(&partition).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Returns a copy of this cursor moved forward by `delta`.
    ///
    /// Partitions whose proposed offset would move backwards keep their
    /// current value.
    pub fn advanced(&self, delta: &OffsetMap) -> Cursor {
        let mut next = self.clone();
        for (&partition, &offset) in delta {
            match next.offsets.get(&partition) {
                Some(&current) if offset < current => {
                    warn!(
                        topic = self.topic.as_str(),
                        partition = partition,
                        current_offset = current,
                        proposed_offset = offset,
                        "Ignoring cursor regression"
                    );
                }
                _ => {
                    next.offsets.insert(partition, offset);
                }
            }
        }
        next
    }

    /// True when `delta` would move at least one partition forward.
    pub fn would_advance(&self, delta: &OffsetMap) -> bool {
        delta
            .iter()
            .any(|(partition, &offset)| self.next_offset(*partition).map_or(true, |c| offset > c))
    }
}
