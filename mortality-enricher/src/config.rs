use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, ensure, Context, Result};
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::date::DateFormat;
use crate::ingest::{ConsumerConfigBuilder, StartingPoint, WireFormat};
use crate::join::{DuplicatePolicy, JoinConfig};
use crate::pipeline::PipelineConfig;
use crate::reference::{ReferenceConfig, TableSpec};
use crate::sink::SinkRetryConfig;
use crate::utils::BackoffPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "mortality-enricher")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "hospital_trends")]
    pub kafka_consumer_topic: String,

    // Comma separated partition ids; empty means discover from topic metadata
    #[envconfig(default = "")]
    pub kafka_partitions: String,

    // Where to start when no cursor has been committed yet: earliest | latest
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10")]
    pub kafka_metadata_timeout_secs: u64,

    // Input record format: csv | json
    #[envconfig(default = "csv")]
    pub wire_format: String,

    #[envconfig(default = "MMM-yy")]
    pub stream_date_format: String,

    // Reference data configuration
    #[envconfig(default = "./data/hospital_data.csv")]
    pub hospital_data_path: String,

    #[envconfig(default = "MMM-yy")]
    pub hospital_data_date_format: String,

    #[envconfig(default = "./data/health_category.csv")]
    pub health_category_path: String,

    #[envconfig(default = "MM/yyyy")]
    pub health_category_date_format: String,

    #[envconfig(default = "0.05")]
    pub max_malformed_fraction: f64,

    #[envconfig(default = "0")] // 0 disables periodic reloads
    pub reference_refresh_interval_secs: u64,

    // Which reference row wins on duplicate keys: first | last
    #[envconfig(default = "first")]
    pub duplicate_match_policy: String,

    // Output configuration
    #[envconfig(default = "./output")]
    pub output_path: String,

    #[envconfig(default = "100")]
    pub max_commit_records: usize,

    // Micro-batch configuration
    #[envconfig(default = "500")]
    pub batch_max_records: usize,

    #[envconfig(default = "1000")]
    pub batch_max_wait_ms: u64,

    #[envconfig(default = "10")]
    pub poll_retry_budget: u32,

    #[envconfig(default = "100")]
    pub poll_initial_backoff_ms: u64,

    #[envconfig(default = "30000")]
    pub poll_max_backoff_ms: u64,

    #[envconfig(default = "5")]
    pub sink_max_retries: u32,

    #[envconfig(default = "100")]
    pub sink_initial_backoff_ms: u64,

    #[envconfig(default = "10000")]
    pub sink_max_backoff_ms: u64,

    #[envconfig(default = "30")]
    pub health_deadline_secs: u64,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Check every setting that is parsed lazily, so bad values fail at startup.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.kafka_consumer_topic.trim().is_empty(), "KAFKA_CONSUMER_TOPIC must not be empty");
        self.kafka_partitions().context("Invalid KAFKA_PARTITIONS")?;
        self.starting_point().context("Invalid KAFKA_CONSUMER_OFFSET_RESET")?;
        self.wire_format().context("Invalid WIRE_FORMAT")?;
        self.to_join_config().context("Invalid join settings")?;
        self.to_reference_config().context("Invalid reference data settings")?;

        ensure!(
            (0.0..=1.0).contains(&self.max_malformed_fraction),
            "MAX_MALFORMED_FRACTION must be within [0, 1], got {}",
            self.max_malformed_fraction
        );
        ensure!(self.batch_max_records > 0, "BATCH_MAX_RECORDS must be positive");
        ensure!(self.batch_max_wait_ms > 0, "BATCH_MAX_WAIT_MS must be positive");
        ensure!(self.max_commit_records > 0, "MAX_COMMIT_RECORDS must be positive");
        ensure!(
            self.poll_initial_backoff_ms <= self.poll_max_backoff_ms,
            "POLL_INITIAL_BACKOFF_MS must not exceed POLL_MAX_BACKOFF_MS"
        );
        ensure!(
            self.sink_initial_backoff_ms <= self.sink_max_backoff_ms,
            "SINK_INITIAL_BACKOFF_MS must not exceed SINK_MAX_BACKOFF_MS"
        );
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn health_deadline(&self) -> Duration {
        Duration::from_secs(self.health_deadline_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_metadata_timeout_secs)
    }

    pub fn starting_point(&self) -> Result<StartingPoint> {
        self.kafka_consumer_offset_reset.parse().map_err(|e| anyhow!("{e}"))
    }

    pub fn wire_format(&self) -> Result<WireFormat> {
        self.wire_format.parse().map_err(|e| anyhow!("{e}"))
    }

    /// Explicitly configured partitions, `None` when they should be discovered.
    pub fn kafka_partitions(&self) -> Result<Option<Vec<i32>>> {
        if self.kafka_partitions.trim().is_empty() {
            return Ok(None);
        }

        let mut partitions = self
            .kafka_partitions
            .split(',')
            .map(|p| {
                let p = p.trim();
                p.parse::<i32>()
                    .ok()
                    .filter(|id| *id >= 0)
                    .ok_or_else(|| anyhow!("'{p}' is not a partition id"))
            })
            .collect::<Result<Vec<_>>>()?;
        partitions.sort_unstable();
        partitions.dedup();
        Ok(Some(partitions))
    }

    /// Output directory of one partition: `<output>/<topic>/partition=<n>`
    pub fn partition_output_dir(&self, partition: i32) -> PathBuf {
        PathBuf::from(&self.output_path)
            .join(&self.kafka_consumer_topic)
            .join(format!("partition={partition}"))
    }

    /// rdkafka settings for one assign-only partition consumer
    pub fn to_consumer_config(&self) -> Result<ClientConfig> {
        Ok(
            ConsumerConfigBuilder::for_partition_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_offset_reset(self.starting_point()?)
                .build(),
        )
    }

    pub fn to_reference_config(&self) -> Result<ReferenceConfig> {
        Ok(ReferenceConfig {
            hospital: TableSpec::new(
                "hospital",
                self.hospital_data_path.clone(),
                parse_date_format(&self.hospital_data_date_format)?,
            ),
            health_category: TableSpec::new(
                "health_category",
                self.health_category_path.clone(),
                parse_date_format(&self.health_category_date_format)?,
            ),
            max_malformed_fraction: self.max_malformed_fraction,
            refresh_interval: match self.reference_refresh_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    pub fn to_join_config(&self) -> Result<JoinConfig> {
        Ok(JoinConfig {
            stream_date_format: parse_date_format(&self.stream_date_format)?,
            duplicate_policy: self
                .duplicate_match_policy
                .parse::<DuplicatePolicy>()
                .map_err(|e| anyhow!("{e}"))?,
        })
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_max_records: self.batch_max_records,
            batch_max_wait: Duration::from_millis(self.batch_max_wait_ms),
            poll_retry_budget: self.poll_retry_budget,
            poll_backoff: BackoffPolicy::doubling(
                Duration::from_millis(self.poll_initial_backoff_ms),
                Duration::from_millis(self.poll_max_backoff_ms),
            ),
            sink_retry: SinkRetryConfig {
                max_retries: self.sink_max_retries,
                backoff: BackoffPolicy::doubling(
                    Duration::from_millis(self.sink_initial_backoff_ms),
                    Duration::from_millis(self.sink_max_backoff_ms),
                ),
            },
        }
    }
}

fn parse_date_format(raw: &str) -> Result<DateFormat> {
    raw.parse().map_err(|e| anyhow!("{e}"))
}
