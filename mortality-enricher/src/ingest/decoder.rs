//! Wire decoding of stream payloads into [`RawEvent`]s.
//!
//! Producers publish one record per message, either as a single CSV line in
//! the column order `Date,Setting,Category,System,Facility Name,Count` (no
//! header) or as a JSON object keyed by those same column names.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::event::RawEvent;

const CSV_COLUMN_COUNT: usize = 6;

#[derive(Error, Debug)]
pub enum DecodeErrorKind {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid count '{0}'")]
    InvalidCount(String),

    #[error("payload holds more than one record")]
    MultipleRecords,

    #[error("malformed csv payload: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl DecodeErrorKind {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            DecodeErrorKind::EmptyPayload => "empty_payload",
            DecodeErrorKind::FieldCount { .. } => "field_count",
            DecodeErrorKind::InvalidCount(_) => "invalid_count",
            DecodeErrorKind::MultipleRecords => "multiple_records",
            DecodeErrorKind::Csv(_) => "csv",
            DecodeErrorKind::Json(_) => "json",
        }
    }
}

/// Turns one transport payload into a typed record.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<RawEvent, DecodeErrorKind>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Csv,
    Json,
}

impl WireFormat {
    pub fn decoder(&self) -> Box<dyn RecordDecoder> {
        match self {
            WireFormat::Csv => Box::new(CsvDecoder),
            WireFormat::Json => Box::new(JsonDecoder),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "csv" => Ok(WireFormat::Csv),
            "json" => Ok(WireFormat::Json),
            other => Err(format!("Unknown wire format: {other}, must be csv or json")),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Csv => f.write_str("csv"),
            WireFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDecoder;

impl RecordDecoder for CsvDecoder {
    fn decode(&self, payload: &[u8]) -> Result<RawEvent, DecodeErrorKind> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeErrorKind::EmptyPayload);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(payload);
        let mut records = reader.records();

        let record = match records.next() {
            Some(record) => record?,
            None => return Err(DecodeErrorKind::EmptyPayload),
        };
        if records.next().is_some() {
            return Err(DecodeErrorKind::MultipleRecords);
        }
        if record.len() != CSV_COLUMN_COUNT {
            return Err(DecodeErrorKind::FieldCount {
                expected: CSV_COLUMN_COUNT,
                found: record.len(),
            });
        }

        let field = |idx: usize| record.get(idx).unwrap_or_default().to_string();
        let raw_count = record.get(5).unwrap_or_default();
        let count = raw_count
            .parse::<i64>()
            .map_err(|_| DecodeErrorKind::InvalidCount(raw_count.to_string()))?;

        Ok(RawEvent {
            date: field(0),
            setting: field(1),
            category: field(2),
            system: field(3),
            facility_name: field(4),
            count,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl RecordDecoder for JsonDecoder {
    fn decode(&self, payload: &[u8]) -> Result<RawEvent, DecodeErrorKind> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeErrorKind::EmptyPayload);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}
