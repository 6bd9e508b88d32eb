//! Left-outer join of stream records against the reference snapshot.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::date::{DateFormat, DateParseError, NormalizedDate};
use crate::event::{EnrichedRecord, RawEvent};
use crate::ingest::batch::SourcedEvent;
use crate::metrics_consts::{JOIN_ERRORS, JOIN_LOOKUPS};
use crate::reference::table::{JoinKey, ReferenceData, ReferenceRow, ReferenceTable};

const HOSPITAL_TABLE: &str = "hospital";
const HEALTH_CATEGORY_TABLE: &str = "health_category";

/// Which row wins when a reference table holds several rows for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// First matching row in file order
    #[default]
    First,
    /// Last matching row in file order
    Last,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "first" => Ok(DuplicatePolicy::First),
            "last" => Ok(DuplicatePolicy::Last),
            other => Err(format!(
                "Unknown duplicate match policy: {other}, must be first or last"
            )),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::First => f.write_str("first"),
            DuplicatePolicy::Last => f.write_str("last"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinConfig {
    pub stream_date_format: DateFormat,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            stream_date_format: DateFormat::MonthAbbrevShortYear,
            duplicate_policy: DuplicatePolicy::First,
        }
    }
}

/// Why a stream record could not be enriched. The record is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("invalid event date: {0}")]
    InvalidDate(#[from] DateParseError),

    #[error("blank join key field '{0}'")]
    EmptyKeyField(&'static str),

    #[error("negative count {0}")]
    NegativeCount(i64),

    #[error("total count overflows i64 ({count1} + {count2:?} + {count3:?})")]
    CountOverflow {
        count1: i64,
        count2: Option<i64>,
        count3: Option<i64>,
    },
}

impl JoinError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            JoinError::InvalidDate(_) => "invalid_date",
            JoinError::EmptyKeyField(_) => "empty_key_field",
            JoinError::NegativeCount(_) => "negative_count",
            JoinError::CountOverflow { .. } => "count_overflow",
        }
    }
}

/// A record dropped by the join, with its position in the input log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub partition: i32,
    pub offset: i64,
    pub error: JoinError,
}

#[derive(Debug, Default)]
pub struct JoinOutcome {
    pub records: Vec<EnrichedRecord>,
    pub failures: Vec<FailedRecord>,
}

/// `count1 + count2 + count3`, absent counts contributing zero.
/// `None` on overflow.
pub fn total_count(count1: i64, count2: Option<i64>, count3: Option<i64>) -> Option<i64> {
    count1
        .checked_add(count2.unwrap_or(0))?
        .checked_add(count3.unwrap_or(0))
}

#[derive(Debug, Clone, Default)]
pub struct JoinEngine {
    config: JoinConfig,
}

impl JoinEngine {
    pub fn new(config: JoinConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    pub fn enrich(
        &self,
        event: &RawEvent,
        reference: &ReferenceData,
    ) -> Result<EnrichedRecord, JoinError> {
        let date = NormalizedDate::parse(&event.date, self.config.stream_date_format)?;

        let category = event.category.trim();
        if category.is_empty() {
            return Err(JoinError::EmptyKeyField("category"));
        }
        let setting = event.setting.trim();
        if setting.is_empty() {
            return Err(JoinError::EmptyKeyField("setting"));
        }
        if event.count < 0 {
            return Err(JoinError::NegativeCount(event.count));
        }

        let key = JoinKey::new(date, category, setting);
        let count2 = self
            .pick(HOSPITAL_TABLE, &reference.hospital, &key)
            .map(|row| row.count);
        let count3 = self
            .pick(HEALTH_CATEGORY_TABLE, &reference.health_category, &key)
            .map(|row| row.count);

        let total = total_count(event.count, count2, count3).ok_or(JoinError::CountOverflow {
            count1: event.count,
            count2,
            count3,
        })?;

        Ok(EnrichedRecord {
            date,
            setting: setting.to_string(),
            category: category.to_string(),
            system: event.system.trim().to_string(),
            facility_name: event.facility_name.trim().to_string(),
            count1: event.count,
            count2,
            count3,
            total_count: total,
        })
    }

    /// Enrich every event in a micro-batch against one reference snapshot.
    /// Failed records are collected, never abort the batch.
    pub fn enrich_batch(&self, events: &[SourcedEvent], reference: &ReferenceData) -> JoinOutcome {
        let mut outcome = JoinOutcome {
            records: Vec::with_capacity(events.len()),
            failures: Vec::new(),
        };

        for sourced in events {
            match self.enrich(&sourced.event, reference) {
                Ok(record) => outcome.records.push(record),
                Err(error) => {
                    warn!(
                        partition = sourced.partition.partition_number(),
                        offset = sourced.offset,
                        error = %error,
                        "Dropping record that failed to join"
                    );
                    metrics::counter!(JOIN_ERRORS, "error" => error.error_type()).increment(1);
                    outcome.failures.push(FailedRecord {
                        partition: sourced.partition.partition_number(),
                        offset: sourced.offset,
                        error,
                    });
                }
            }
        }

        outcome
    }

    fn pick<'a>(
        &self,
        table_label: &'static str,
        table: &'a ReferenceTable,
        key: &JoinKey,
    ) -> Option<&'a ReferenceRow> {
        let rows = table.lookup(key);
        let outcome = match rows.len() {
            0 => "miss",
            1 => "hit",
            _ => "ambiguous",
        };
        metrics::counter!(JOIN_LOOKUPS, "table" => table_label, "outcome" => outcome).increment(1);

        match self.config.duplicate_policy {
            DuplicatePolicy::First => rows.first(),
            DuplicatePolicy::Last => rows.last(),
        }
    }
}
