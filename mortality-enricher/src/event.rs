use serde::{Deserialize, Serialize};

use crate::date::NormalizedDate;

/// A hospital mortality record as it arrives on the input topic.
///
/// Field names on the wire follow the published dataset headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Setting")]
    pub setting: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "System")]
    pub system: String,
    #[serde(rename = "Facility Name")]
    pub facility_name: String,
    #[serde(rename = "Count")]
    pub count: i64,
}

/// Output row: the stream record plus the counts matched in both reference tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedRecord {
    pub date: NormalizedDate,
    pub setting: String,
    pub category: String,
    pub system: String,
    pub facility_name: String,
    /// Count carried by the stream record
    pub count1: i64,
    /// Count from the hospital (diagnosis type) table, if a row matched
    pub count2: Option<i64>,
    /// Count from the health category table, if a row matched
    pub count3: Option<i64>,
    pub total_count: i64,
}
