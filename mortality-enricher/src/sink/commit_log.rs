use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{Cursor, OffsetMap};

// directory holding one JSON commit record per committed batch
pub const COMMITS_DIR: &str = "commits";
// directory holding the Parquet output files
pub const DATA_DIR: &str = "data";
// suffix for files that are still being written
pub const TMP_SUFFIX: &str = ".tmp";

const COMMIT_SUFFIX: &str = ".json";
const DATA_PREFIX: &str = "part-";
const DATA_SUFFIX: &str = ".parquet";

/// The commit point of one batch: once this record is durable the batch's
/// data file and cursor are part of the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Monotonic batch sequence number, starting at 1
    pub sequence: u64,
    /// Input topic the offsets belong to
    pub topic: String,
    /// Next offset to consume per partition after this batch
    pub offsets: OffsetMap,
    /// Data files written by this batch, relative to the partition directory
    pub files: Vec<String>,
    pub record_count: usize,
    pub committed_at: DateTime<Utc>,
}

impl CommitRecord {
    pub fn new(sequence: u64, cursor: &Cursor, files: Vec<String>, record_count: usize) -> Self {
        Self {
            sequence,
            topic: cursor.topic().to_string(),
            offsets: cursor.offsets().clone(),
            files,
            record_count,
            committed_at: Utc::now(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::with_offsets(self.topic.clone(), self.offsets.clone())
    }

    pub fn from_json_bytes(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("Failed to serialize commit record")
    }
}

/// `<sequence>.json`, zero padded so names sort in commit order.
pub fn commit_file_name(sequence: u64) -> String {
    format!("{sequence:020}{COMMIT_SUFFIX}")
}

/// `part-<sequence>.parquet`
pub fn data_file_name(sequence: u64) -> String {
    format!("{DATA_PREFIX}{sequence:020}{DATA_SUFFIX}")
}

pub fn parse_commit_file_name(name: &str) -> Option<u64> {
    parse_sequence(name, "", COMMIT_SUFFIX)
}

pub fn parse_data_file_name(name: &str) -> Option<u64> {
    parse_sequence(name, DATA_PREFIX, DATA_SUFFIX)
}

fn parse_sequence(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
