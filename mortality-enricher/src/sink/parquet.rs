//! Parquet encoding of enriched batches.
//!
//! Column layout of every output file:
//!
//! | column          | type   | nullable |
//! |-----------------|--------|----------|
//! | `date`          | Date32 | no       |
//! | `setting`       | Utf8   | no       |
//! | `category`      | Utf8   | no       |
//! | `system`        | Utf8   | no       |
//! | `facility_name` | Utf8   | no       |
//! | `count1`        | Int64  | no       |
//! | `count2`        | Int64  | yes      |
//! | `count3`        | Int64  | yes      |
//! | `total_count`   | Int64  | no       |

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array as _, Date32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::date::NormalizedDate;
use crate::event::EnrichedRecord;
use crate::sink::storage::StorageError;

const CREATED_BY: &str = concat!("mortality-enricher ", env!("CARGO_PKG_VERSION"));

pub fn output_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, false),
        Field::new("setting", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("system", DataType::Utf8, false),
        Field::new("facility_name", DataType::Utf8, false),
        Field::new("count1", DataType::Int64, false),
        Field::new("count2", DataType::Int64, true),
        Field::new("count3", DataType::Int64, true),
        Field::new("total_count", DataType::Int64, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(CREATED_BY.to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn schema_error(stage: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Schema(format!("{stage}: {e}"))
}

/// Encode `records` as a complete Parquet file.
pub fn encode_batch(records: &[EnrichedRecord]) -> Result<Bytes, StorageError> {
    let schema = output_schema();

    let dates = Date32Array::from(
        records
            .iter()
            .map(|r| r.date.days_since_epoch())
            .collect::<Vec<_>>(),
    );
    let count1 = Int64Array::from(records.iter().map(|r| r.count1).collect::<Vec<_>>());
    let count2 = Int64Array::from(records.iter().map(|r| r.count2).collect::<Vec<_>>());
    let count3 = Int64Array::from(records.iter().map(|r| r.count3).collect::<Vec<_>>());
    let totals = Int64Array::from(records.iter().map(|r| r.total_count).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(dates),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.setting.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.category.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.system.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.facility_name.as_str()),
            )),
            Arc::new(count1),
            Arc::new(count2),
            Arc::new(count3),
            Arc::new(totals),
        ],
    )
    .map_err(|e| schema_error("record batch build failed", e))?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties()))
        .map_err(|e| schema_error("parquet writer init failed", e))?;
    writer
        .write(&batch)
        .map_err(|e| schema_error("parquet write failed", e))?;
    writer
        .close()
        .map_err(|e| schema_error("parquet close failed", e))?;
    Ok(Bytes::from(cursor.into_inner()))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, StorageError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| schema_error(&format!("missing column '{name}'"), e))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StorageError::Schema(format!("column '{name}' has unexpected type")))
}

/// Decode a Parquet file written by [`encode_batch`].
pub fn decode_batch(bytes: Bytes) -> Result<Vec<EnrichedRecord>, StorageError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|e| schema_error("parquet reader init failed", e))?
        .build()
        .map_err(|e| schema_error("parquet reader build failed", e))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| schema_error("parquet read batch failed", e))?;

        let dates = column::<Date32Array>(&batch, "date")?;
        let settings = column::<StringArray>(&batch, "setting")?;
        let categories = column::<StringArray>(&batch, "category")?;
        let systems = column::<StringArray>(&batch, "system")?;
        let facilities = column::<StringArray>(&batch, "facility_name")?;
        let count1 = column::<Int64Array>(&batch, "count1")?;
        let count2 = column::<Int64Array>(&batch, "count2")?;
        let count3 = column::<Int64Array>(&batch, "count3")?;
        let totals = column::<Int64Array>(&batch, "total_count")?;

        let nullable = |array: &Int64Array, row: usize| {
            if array.is_null(row) {
                None
            } else {
                Some(array.value(row))
            }
        };

        for row in 0..batch.num_rows() {
            let date = NormalizedDate::from_days_since_epoch(dates.value(row)).ok_or_else(|| {
                StorageError::Schema(format!("date out of range in row {row}"))
            })?;
            records.push(EnrichedRecord {
                date,
                setting: settings.value(row).to_string(),
                category: categories.value(row).to_string(),
                system: systems.value(row).to_string(),
                facility_name: facilities.value(row).to_string(),
                count1: count1.value(row),
                count2: nullable(count2, row),
                count3: nullable(count3, row),
                total_count: totals.value(row),
            });
        }
    }
    Ok(records)
}
