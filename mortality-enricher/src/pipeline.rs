//! Per-partition coordinator: poll, enrich, append, repeat.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cursor::Cursor;
use crate::error::PipelineError;
use crate::health::{ComponentStatus, HealthHandle};
use crate::ingest::{MessageSource, PolledBatch, StreamIngestor};
use crate::join::JoinEngine;
use crate::metrics_consts::{
    INGEST_COMMIT_FAILURES, INGEST_POLL_RETRIES, PIPELINE_BATCHES, PIPELINE_BATCH_DURATION_MS,
    PIPELINE_BATCH_SIZE, PIPELINE_STATE_TRANSITIONS,
};
use crate::reference::ReferenceStore;
use crate::sink::{Ack, BatchStorage, CheckpointedSink, SinkRetryConfig};
use crate::utils::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub batch_max_records: usize,
    pub batch_max_wait: Duration,
    /// Consecutive transient poll failures tolerated before giving up
    pub poll_retry_budget: u32,
    pub poll_backoff: BackoffPolicy,
    pub sink_retry: SinkRetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max_records: 500,
            batch_max_wait: Duration::from_secs(1),
            poll_retry_budget: 10,
            poll_backoff: BackoffPolicy::default(),
            sink_retry: SinkRetryConfig::default(),
        }
    }
}

/// What a pipeline did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub records_written: u64,
    pub decode_errors: u64,
    pub join_errors: u64,
    /// Cursor after the last durable batch
    pub cursor: Cursor,
}

/// Drives one input partition from subscription to shutdown.
///
/// The next poll never starts before the previous append was acknowledged,
/// and an append in flight is never cancelled.
pub struct Pipeline<S, B> {
    ingestor: StreamIngestor<S>,
    storage: B,
    join: JoinEngine,
    references: Arc<ReferenceStore>,
    config: PipelineConfig,
    health: Option<HealthHandle>,
}

impl<S: MessageSource, B: BatchStorage> Pipeline<S, B> {
    pub fn new(
        ingestor: StreamIngestor<S>,
        storage: B,
        join: JoinEngine,
        references: Arc<ReferenceStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ingestor,
            storage,
            join,
            references,
            config,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    pub fn partition(&self) -> i32 {
        self.ingestor.partition()
    }

    /// Run until `shutdown` fires, the input ends, or a fatal error occurs.
    pub async fn run(self, shutdown: &CancellationToken) -> Result<RunSummary, PipelineError> {
        let Pipeline {
            mut ingestor,
            storage,
            join,
            references,
            config,
            health,
        } = self;
        let partition = ingestor.partition();
        let mut state = StateTracker::new(partition);

        let sink = match CheckpointedSink::open(storage, ingestor.topic(), config.sink_retry).await
        {
            Ok(sink) => sink,
            Err(source) => {
                state.enter(PipelineState::Stopped);
                return Err(PipelineError::Write { partition, source });
            }
        };

        let resume = sink.cursor().next_offset(partition);
        match ingestor.subscribe(resume).await {
            Ok(start) => info!(partition = partition, start = %start, "Subscribed to input"),
            Err(source) => {
                state.enter(PipelineState::Stopped);
                return Err(PipelineError::Ingest { partition, source });
            }
        }

        let mut worker = Worker {
            partition,
            ingestor,
            sink,
            join,
            references,
            config,
            health,
            state,
            summary: RunSummary::default(),
        };
        let result = worker.run_loop(shutdown).await;
        worker.state.enter(PipelineState::Stopped);

        match result {
            Ok(()) => {
                worker.summary.cursor = worker.sink.cursor().clone();
                info!(
                    partition = partition,
                    batches = worker.summary.batches,
                    records = worker.summary.records_written,
                    "Pipeline stopped"
                );
                Ok(worker.summary)
            }
            Err(e) => {
                error!(partition = partition, error = ?e, "Pipeline failed");
                if let Some(health) = &worker.health {
                    health.report_status(ComponentStatus::Unhealthy).await;
                }
                Err(e)
            }
        }
    }
}

struct StateTracker {
    partition: i32,
    current: PipelineState,
}

impl StateTracker {
    fn new(partition: i32) -> Self {
        let tracker = Self {
            partition,
            current: PipelineState::Starting,
        };
        tracker.record();
        tracker
    }

    fn enter(&mut self, next: PipelineState) {
        if self.current == next {
            return;
        }
        debug!(
            partition = self.partition,
            from = %self.current,
            to = %next,
            "Pipeline state change"
        );
        self.current = next;
        self.record();
    }

    fn record(&self) {
        metrics::counter!(PIPELINE_STATE_TRANSITIONS, "state" => self.current.as_str())
            .increment(1);
    }
}

struct Worker<S, B> {
    partition: i32,
    ingestor: StreamIngestor<S>,
    sink: CheckpointedSink<B>,
    join: JoinEngine,
    references: Arc<ReferenceStore>,
    config: PipelineConfig,
    health: Option<HealthHandle>,
    state: StateTracker,
    summary: RunSummary,
}

impl<S: MessageSource, B: BatchStorage> Worker<S, B> {
    async fn run_loop(&mut self, shutdown: &CancellationToken) -> Result<(), PipelineError> {
        self.state.enter(PipelineState::Running);
        let mut consecutive_poll_failures: u32 = 0;

        loop {
            if let Some(health) = &self.health {
                health.report_healthy().await;
            }
            if shutdown.is_cancelled() {
                self.state.enter(PipelineState::Draining);
                return Ok(());
            }

            let batch = match self
                .ingestor
                .poll_batch(
                    self.config.batch_max_records,
                    self.config.batch_max_wait,
                    shutdown,
                )
                .await
            {
                Ok(batch) => {
                    consecutive_poll_failures = 0;
                    batch
                }
                Err(e) if e.is_transient() && consecutive_poll_failures < self.config.poll_retry_budget => {
                    let delay = self.config.poll_backoff.next_delay(consecutive_poll_failures);
                    consecutive_poll_failures += 1;
                    warn!(
                        partition = self.partition,
                        attempt = consecutive_poll_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = ?e,
                        "Transient ingestion error, retrying poll"
                    );
                    metrics::counter!(INGEST_POLL_RETRIES).increment(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(source) => {
                    return Err(PipelineError::Ingest {
                        partition: self.partition,
                        source,
                    });
                }
            };

            let last_batch = batch.shutdown_requested() || batch.source_exhausted();
            if last_batch {
                self.state.enter(PipelineState::Draining);
            }

            self.process_batch(batch).await?;

            if last_batch {
                return Ok(());
            }
        }
    }

    async fn process_batch(&mut self, batch: PolledBatch) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let (events, decode_errors, offsets) = batch.unpack();

        let snapshot = self.references.snapshot();
        let outcome = self.join.enrich_batch(&events, &snapshot);

        let ack = self
            .sink
            .append_batch(&outcome.records, &offsets)
            .await
            .map_err(|source| PipelineError::Write {
                partition: self.partition,
                source,
            })?;

        self.summary.decode_errors += decode_errors.len() as u64;
        self.summary.join_errors += outcome.failures.len() as u64;

        if let Ack::Committed { sequence, records } = ack {
            self.summary.batches += 1;
            self.summary.records_written += records as u64;

            if let Err(e) = self.ingestor.commit(self.sink.cursor()).await {
                warn!(
                    partition = self.partition,
                    sequence = sequence,
                    error = ?e,
                    "Failed to commit offsets to the transport, sink cursor is unaffected"
                );
                metrics::counter!(INGEST_COMMIT_FAILURES).increment(1);
            }

            metrics::counter!(PIPELINE_BATCHES).increment(1);
            metrics::histogram!(PIPELINE_BATCH_SIZE).record(events.len() as f64);
            metrics::histogram!(PIPELINE_BATCH_DURATION_MS)
                .record(start.elapsed().as_millis() as f64);
            debug!(
                partition = self.partition,
                sequence = sequence,
                events = events.len(),
                written = records,
                decode_errors = decode_errors.len(),
                join_errors = outcome.failures.len(),
                "Processed batch"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::NormalizedDate;
    use crate::ingest::decoder::CsvDecoder;
    use crate::ingest::memory::{MemoryLog, MemorySource};
    use crate::ingest::{IngestError, StartingPoint};
    use crate::reference::{ReferenceData, ReferenceRow};
    use crate::sink::{FailurePoint, MemoryStorage};

    const TOPIC: &str = "hospital_trends";

    fn references() -> Arc<ReferenceStore> {
        let hospital = vec![ReferenceRow {
            date: NormalizedDate::new(2024, 1).unwrap(),
            category: "A".to_string(),
            setting: "ER".to_string(),
            system: String::new(),
            facility_name: String::new(),
            count: 5,
        }];
        Arc::new(ReferenceStore::new(ReferenceData::new(
            hospital.into_iter().collect(),
            Default::default(),
        )))
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            batch_max_records: 10,
            batch_max_wait: Duration::from_millis(20),
            poll_retry_budget: 2,
            poll_backoff: BackoffPolicy::doubling(Duration::from_millis(1), Duration::from_millis(5)),
            sink_retry: SinkRetryConfig {
                max_retries: 2,
                backoff: BackoffPolicy::doubling(
                    Duration::from_millis(1),
                    Duration::from_millis(5),
                ),
            },
        }
    }

    fn pipeline(log: &MemoryLog, storage: &MemoryStorage) -> Pipeline<MemorySource, MemoryStorage> {
        let ingestor = StreamIngestor::new(
            log.source(),
            Arc::new(CsvDecoder),
            TOPIC,
            0,
            StartingPoint::Earliest,
        );
        Pipeline::new(
            ingestor,
            storage.clone(),
            JoinEngine::default(),
            references(),
            test_config(),
        )
    }

    #[tokio::test]
    async fn test_runs_until_input_ends() {
        let log = MemoryLog::new(TOPIC);
        log.append(0, "Jan-24,ER,A,S,F,10");
        log.append(0, "Jan-24,ER,B,S,F,3");
        log.close();
        let storage = MemoryStorage::new();

        let summary = pipeline(&log, &storage)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.cursor.next_offset(0), Some(2));
        assert_eq!(log.committed().get(&0), Some(&2));

        let written = storage.committed_records();
        assert_eq!(written[0].total_count, 15);
        assert_eq!(written[1].total_count, 3);
    }

    #[tokio::test]
    async fn test_poll_retry_budget_stops_pipeline() {
        let log = MemoryLog::new(TOPIC);
        for _ in 0..3 {
            log.inject_error(IngestError::transient(anyhow::anyhow!("broker down")));
        }
        let storage = MemoryStorage::new();

        let err = pipeline(&log, &storage)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_class(), "ingest");
    }

    #[tokio::test]
    async fn test_transient_poll_errors_within_budget_are_absorbed() {
        let log = MemoryLog::new(TOPIC);
        log.inject_error(IngestError::transient(anyhow::anyhow!("broker down")));
        log.append(0, "Jan-24,ER,A,S,F,10");
        log.close();
        let storage = MemoryStorage::new();

        let summary = pipeline(&log, &storage)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.records_written, 1);
    }

    #[tokio::test]
    async fn test_fatal_sink_error_stops_pipeline() {
        let log = MemoryLog::new(TOPIC);
        log.append(0, "Jan-24,ER,A,S,F,10");
        let storage = MemoryStorage::new();
        storage.inject(FailurePoint::FatalError);

        let err = pipeline(&log, &storage)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_class(), "write");
        assert_eq!(storage.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_stops() {
        let log = MemoryLog::new(TOPIC);
        log.append(0, "Jan-24,ER,A,S,F,10");
        let storage = MemoryStorage::new();

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let watcher = storage.clone();
        tokio::spawn(async move {
            while watcher.commit_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline(&log, &storage).run(&shutdown),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.cursor.next_offset(0), Some(1));
    }
}
