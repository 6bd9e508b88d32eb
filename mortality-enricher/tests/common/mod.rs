#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mortality_enricher::date::DateFormat;
use mortality_enricher::ingest::memory::{MemoryLog, MemorySource};
use mortality_enricher::ingest::{CsvDecoder, StartingPoint, StreamIngestor};
use mortality_enricher::join::JoinEngine;
use mortality_enricher::pipeline::{Pipeline, PipelineConfig};
use mortality_enricher::reference::{
    load_reference_data, FileTableSource, ReferenceConfig, ReferenceLoader, ReferenceStore,
    TableSpec,
};
use mortality_enricher::sink::{BatchStorage, SinkRetryConfig};
use mortality_enricher::utils::BackoffPolicy;

pub const TOPIC: &str = "hospital_trends";

pub const HOSPITAL_CSV: &str = "\
Date,Setting,Category,System,Facility Name,Count
Jan-24,ER,A,Fraser Health,Burnaby Hospital,5
Jan-24,ICU,A,Fraser Health,Burnaby Hospital,2
Feb-24,ER,B,Interior Health,Kelowna General,4
";

pub const HEALTH_CATEGORY_CSV: &str = "\
Date,Setting,Category,Count
01/2024,ER,B,7
02/2024,ER,B,1
";

/// Short waits and quick retries so tests finish in milliseconds.
pub fn fast_config() -> PipelineConfig {
    let backoff = BackoffPolicy::doubling(Duration::from_millis(1), Duration::from_millis(5));
    PipelineConfig {
        batch_max_records: 10,
        batch_max_wait: Duration::from_millis(20),
        poll_retry_budget: 3,
        poll_backoff: backoff,
        sink_retry: SinkRetryConfig {
            max_retries: 3,
            backoff,
        },
    }
}

/// Write both reference tables under `dir` and load them the way the
/// service does at startup.
pub async fn load_references(dir: &Path) -> Arc<ReferenceStore> {
    let hospital = dir.join("hospital_data.csv");
    let health_category = dir.join("health_category.csv");
    std::fs::write(&hospital, HOSPITAL_CSV).unwrap();
    std::fs::write(&health_category, HEALTH_CATEGORY_CSV).unwrap();

    let config = ReferenceConfig {
        hospital: TableSpec::new(
            "hospital",
            hospital.to_string_lossy(),
            DateFormat::MonthAbbrevShortYear,
        ),
        health_category: TableSpec::new(
            "health_category",
            health_category.to_string_lossy(),
            DateFormat::NumericMonthYear,
        ),
        max_malformed_fraction: 0.0,
        refresh_interval: None,
    };
    let loader = ReferenceLoader::new(Arc::new(FileTableSource), config.max_malformed_fraction);
    let data = load_reference_data(&loader, &config).await.unwrap();
    Arc::new(ReferenceStore::new(data))
}

pub fn memory_pipeline<B: BatchStorage>(
    log: &MemoryLog,
    partition: i32,
    storage: B,
    references: Arc<ReferenceStore>,
) -> Pipeline<MemorySource, B> {
    let ingestor = StreamIngestor::new(
        log.source(),
        Arc::new(CsvDecoder),
        TOPIC,
        partition,
        StartingPoint::Earliest,
    );
    Pipeline::new(
        ingestor,
        storage,
        JoinEngine::default(),
        references,
        fast_config(),
    )
}
