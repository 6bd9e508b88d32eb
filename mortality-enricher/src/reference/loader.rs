use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::date::{DateFormat, DateParseError, NormalizedDate};
use crate::metrics_consts::{REFERENCE_ROWS_LOADED, REFERENCE_ROWS_REJECTED};
use crate::reference::source::TableSource;
use crate::reference::table::{ReferenceRow, ReferenceTable};

const COL_DATE: &str = "date";
const COL_SETTING: &str = "setting";
const COL_CATEGORY: &str = "category";
const COL_COUNT: &str = "count";
const COL_SYSTEM: &str = "system";
const COL_FACILITY_NAME: &str = "facility name";

/// A reference table to load: what it is called, where it lives and how its
/// dates are spelled.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub location: String,
    pub date_format: DateFormat,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, location: impl Into<String>, date_format: DateFormat) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            date_format,
        }
    }
}

/// Settings for loading and refreshing both reference tables.
#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    pub hospital: TableSpec,
    pub health_category: TableSpec,
    /// Share of rejected rows above which a load fails
    pub max_malformed_fraction: f64,
    /// Period between reloads; `None` disables refreshing
    pub refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub total_rows: usize,
    pub loaded_rows: usize,
    pub rejected_rows: usize,
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read reference table '{table}' from {location}")]
    Source {
        table: String,
        location: String,
        source: anyhow::Error,
    },

    #[error("reference table '{table}' is missing required column '{column}'")]
    MissingColumn { table: String, column: &'static str },

    #[error("reference table '{table}' has an unreadable header")]
    Header { table: String, source: csv::Error },

    #[error("reference table '{table}' rejected {rejected} of {total} rows (max fraction {max_fraction})")]
    TooManyMalformedRows {
        table: String,
        rejected: usize,
        total: usize,
        max_fraction: f64,
    },
}

impl LoadError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            LoadError::Source { .. } => "source",
            LoadError::MissingColumn { .. } => "missing_column",
            LoadError::Header { .. } => "header",
            LoadError::TooManyMalformedRows { .. } => "too_many_malformed_rows",
        }
    }
}

// Why a single row was dropped. Never escapes the loader.
#[derive(Error, Debug)]
enum RowError {
    #[error("malformed csv record: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Date(#[from] DateParseError),

    #[error("invalid count '{0}'")]
    InvalidCount(String),

    #[error("negative count {0}")]
    NegativeCount(i64),

    #[error("blank {0}")]
    BlankKeyField(&'static str),
}

struct ColumnIndex {
    date: usize,
    setting: usize,
    category: usize,
    count: usize,
    system: Option<usize>,
    facility_name: Option<usize>,
}

impl ColumnIndex {
    fn from_headers(table: &str, headers: &csv::StringRecord) -> Result<Self, LoadError> {
        let positions: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_lowercase(), idx))
            .collect();

        let required = |column: &'static str| {
            positions
                .get(column)
                .copied()
                .ok_or_else(|| LoadError::MissingColumn {
                    table: table.to_string(),
                    column,
                })
        };

        Ok(Self {
            date: required(COL_DATE)?,
            setting: required(COL_SETTING)?,
            category: required(COL_CATEGORY)?,
            count: required(COL_COUNT)?,
            system: positions.get(COL_SYSTEM).copied(),
            facility_name: positions.get(COL_FACILITY_NAME).copied(),
        })
    }
}

/// Loads reference tables through a [`TableSource`].
#[derive(Clone)]
pub struct ReferenceLoader {
    source: Arc<dyn TableSource>,
    max_malformed_fraction: f64,
}

impl ReferenceLoader {
    pub fn new(source: Arc<dyn TableSource>, max_malformed_fraction: f64) -> Self {
        Self {
            source,
            max_malformed_fraction,
        }
    }

    pub async fn load(&self, spec: &TableSpec) -> Result<ReferenceTable, LoadError> {
        let bytes = self
            .source
            .read(&spec.location)
            .await
            .map_err(|source| LoadError::Source {
                table: spec.name.clone(),
                location: spec.location.clone(),
                source,
            })?;

        let (table, stats) = self.parse_table(spec, &bytes)?;

        metrics::gauge!(REFERENCE_ROWS_LOADED, "table" => spec.name.clone())
            .set(stats.loaded_rows as f64);
        info!(
            table = spec.name.as_str(),
            location = spec.location.as_str(),
            rows = stats.loaded_rows,
            keys = table.key_count(),
            rejected = stats.rejected_rows,
            "Loaded reference table"
        );
        Ok(table)
    }

    /// Parse CSV bytes (with header) into a table. Bad rows are dropped and
    /// counted; too many bad rows fail the whole load.
    pub fn parse_table(
        &self,
        spec: &TableSpec,
        bytes: &[u8],
    ) -> Result<(ReferenceTable, LoadStats), LoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers = reader.headers().map_err(|source| LoadError::Header {
            table: spec.name.clone(),
            source,
        })?;
        let columns = ColumnIndex::from_headers(&spec.name, headers)?;

        let mut table = ReferenceTable::new(spec.name.clone());
        let mut stats = LoadStats::default();

        for (idx, record) in reader.records().enumerate() {
            stats.total_rows += 1;
            // header is line 1
            let line = record
                .as_ref()
                .ok()
                .and_then(|r| r.position())
                .map_or(idx as u64 + 2, |p| p.line());

            match record
                .map_err(RowError::from)
                .and_then(|r| parse_row(&r, &columns, spec.date_format))
            {
                Ok(row) => {
                    table.insert(row);
                    stats.loaded_rows += 1;
                }
                Err(e) => {
                    stats.rejected_rows += 1;
                    warn!(
                        table = spec.name.as_str(),
                        line = line,
                        error = %e,
                        "Rejected reference row"
                    );
                    metrics::counter!(REFERENCE_ROWS_REJECTED, "table" => spec.name.clone())
                        .increment(1);
                }
            }
        }

        if stats.total_rows > 0 {
            let rejected_fraction = stats.rejected_rows as f64 / stats.total_rows as f64;
            if rejected_fraction > self.max_malformed_fraction {
                return Err(LoadError::TooManyMalformedRows {
                    table: spec.name.clone(),
                    rejected: stats.rejected_rows,
                    total: stats.total_rows,
                    max_fraction: self.max_malformed_fraction,
                });
            }
        }

        Ok((table, stats))
    }
}

fn parse_row(
    record: &csv::StringRecord,
    columns: &ColumnIndex,
    date_format: DateFormat,
) -> Result<ReferenceRow, RowError> {
    let field = |idx: usize| record.get(idx).unwrap_or_default();
    let optional = |idx: Option<usize>| idx.map(field).unwrap_or_default().to_string();

    let date = NormalizedDate::parse(field(columns.date), date_format)?;

    let setting = field(columns.setting);
    if setting.is_empty() {
        return Err(RowError::BlankKeyField(COL_SETTING));
    }
    let category = field(columns.category);
    if category.is_empty() {
        return Err(RowError::BlankKeyField(COL_CATEGORY));
    }

    let raw_count = field(columns.count);
    let count = raw_count
        .parse::<i64>()
        .map_err(|_| RowError::InvalidCount(raw_count.to_string()))?;
    if count < 0 {
        return Err(RowError::NegativeCount(count));
    }

    Ok(ReferenceRow {
        date,
        category: category.to_string(),
        setting: setting.to_string(),
        system: optional(columns.system),
        facility_name: optional(columns.facility_name),
        count,
    })
}
