use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::health::HealthRegistry;
use crate::ingest::{KafkaSource, MessageSource, RecordDecoder, StreamIngestor};
use crate::join::JoinEngine;
use crate::pipeline::{Pipeline, RunSummary};
use crate::reference::{
    load_reference_data, FileTableSource, ReferenceLoader, ReferenceRefresher, ReferenceStore,
};
use crate::sink::{BatchStorage, ParquetFileStorage};

/// Wires configuration into one pipeline per input partition and supervises them.
pub struct EnricherService {
    config: Config,
    liveness: HealthRegistry,
}

impl EnricherService {
    pub fn new(config: Config, liveness: HealthRegistry) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;
        Ok(Self { config, liveness })
    }

    /// Run until ctrl-c, the end of input, or a fatal error.
    pub async fn run(self) -> Result<Vec<(i32, RunSummary)>> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<Vec<(i32, RunSummary)>> {
        let config = &self.config;
        let topic = config.kafka_consumer_topic.clone();

        // reference data must be complete before the first record is joined
        let reference_config = config.to_reference_config()?;
        let loader = ReferenceLoader::new(
            Arc::new(FileTableSource),
            reference_config.max_malformed_fraction,
        );
        let data = load_reference_data(&loader, &reference_config)
            .await
            .map_err(PipelineError::from)
            .context("Failed to load reference tables")?;
        let references = Arc::new(ReferenceStore::new(data));

        let consumer_config = config.to_consumer_config()?;
        let partitions = match config.kafka_partitions()? {
            Some(partitions) => partitions,
            None => {
                let discover_config = consumer_config.clone();
                let discover_topic = topic.clone();
                let timeout = config.metadata_timeout();
                tokio::task::spawn_blocking(move || {
                    KafkaSource::discover_partitions(&discover_config, &discover_topic, timeout)
                })
                .await
                .context("Partition discovery task failed")?
                .map_err(|source| PipelineError::Ingest {
                    partition: -1,
                    source,
                })
                .with_context(|| format!("Failed to discover partitions of topic '{topic}'"))?
            }
        };
        info!(topic = topic.as_str(), partitions = ?partitions, "Starting partition pipelines");

        let decoder: Arc<dyn RecordDecoder> = Arc::from(config.wire_format()?.decoder());
        let join = JoinEngine::new(config.to_join_config()?);
        let starting_point = config.starting_point()?;

        let mut pipelines = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let source = KafkaSource::new(&consumer_config)
                .map_err(|source| PipelineError::Ingest { partition, source })
                .with_context(|| format!("Failed to create consumer for partition {partition}"))?;
            let ingestor = StreamIngestor::new(
                source,
                decoder.clone(),
                topic.clone(),
                partition,
                starting_point,
            );
            let storage = ParquetFileStorage::new(
                config.partition_output_dir(partition),
                config.max_commit_records,
            );
            let health = self
                .liveness
                .register(format!("partition-{partition}"), config.health_deadline())
                .await;

            pipelines.push(
                Pipeline::new(
                    ingestor,
                    storage,
                    join.clone(),
                    references.clone(),
                    config.to_pipeline_config(),
                )
                .with_health(health),
            );
        }

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal => info!("Received shutdown signal, shutting down gracefully..."),
                _ = signal_token.cancelled() => {}
            }
            signal_token.cancel();
        });

        let refresher = ReferenceRefresher::new(loader, reference_config, references);
        let refresher_handle = tokio::spawn(refresher.run(shutdown.clone()));

        let result = run_pipelines(pipelines, shutdown.clone(), config.shutdown_timeout()).await;

        shutdown.cancel();
        if let Err(e) = refresher_handle.await {
            warn!("Reference refresher task failed: {e:#}");
        }

        let summaries = result.context("Partition pipeline failed")?;
        info!("Mortality enricher service stopped");
        Ok(summaries)
    }
}

/// Spawn every pipeline and wait for all of them.
///
/// The first failure cancels `shutdown` so the other pipelines drain. Once
/// `shutdown` is cancelled, pipelines still running after `drain_timeout`
/// are aborted. Returns the first error, or every pipeline's summary.
pub async fn run_pipelines<S, B>(
    pipelines: Vec<Pipeline<S, B>>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<Vec<(i32, RunSummary)>, PipelineError>
where
    S: MessageSource + 'static,
    B: BatchStorage + 'static,
{
    let mut tasks = JoinSet::new();
    for pipeline in pipelines {
        let partition = pipeline.partition();
        let token = shutdown.clone();
        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(pipeline.run(&token)).catch_unwind().await;
            let result = outcome.unwrap_or_else(|panic| {
                Err(PipelineError::Worker {
                    partition,
                    message: panic_message(panic.as_ref()),
                })
            });
            (partition, result)
        });
    }

    let mut summaries = Vec::new();
    let mut first_error: Option<PipelineError> = None;
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    loop {
        let joined = match drain_deadline {
            None => tokio::select! {
                joined = tasks.join_next() => joined,
                _ = shutdown.cancelled() => {
                    drain_deadline = Some(tokio::time::Instant::now() + drain_timeout);
                    continue;
                }
            },
            Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!(
                        remaining = tasks.len(),
                        "Pipelines did not drain within {drain_timeout:?}, aborting"
                    );
                    tasks.abort_all();
                    first_error.get_or_insert(PipelineError::DrainTimeout(drain_timeout));
                    break;
                }
            },
        };

        let Some(joined) = joined else {
            break;
        };

        match joined {
            Ok((partition, Ok(summary))) => summaries.push((partition, summary)),
            Ok((partition, Err(e))) => {
                error!(
                    partition = partition,
                    error_class = e.error_class(),
                    "Pipeline failed: {e:#}"
                );
                first_error.get_or_insert(e);
                shutdown.cancel();
            }
            Err(e) => {
                error!("Pipeline task failed to complete: {e:#}");
                shutdown.cancel();
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            summaries.sort_by_key(|(partition, _)| *partition);
            Ok(summaries)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
