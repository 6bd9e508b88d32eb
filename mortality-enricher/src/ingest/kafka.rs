//! rdkafka-backed [`MessageSource`].

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{error, info, warn};

use crate::cursor::Cursor;
use crate::ingest::error::IngestError;
use crate::ingest::source::MessageSource;
use crate::ingest::types::{Partition, SourceMessage, StartingPoint};
use crate::metrics_consts::INGEST_TRANSPORT_ERRORS;

pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(config: &ClientConfig) -> Result<Self, IngestError> {
        let consumer: StreamConsumer = config
            .create()
            .context("Failed to create Kafka consumer")
            .map_err(IngestError::fatal)?;
        Ok(Self { consumer })
    }

    /// List the partitions of `topic` from broker metadata.
    pub fn discover_partitions(
        config: &ClientConfig,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<i32>, IngestError> {
        let consumer: BaseConsumer = config
            .create()
            .context("Failed to create Kafka metadata consumer")
            .map_err(IngestError::fatal)?;

        let metadata = consumer
            .fetch_metadata(Some(topic), timeout)
            .with_context(|| format!("Failed to fetch metadata for topic '{topic}'"))
            .map_err(IngestError::transient)?;

        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| IngestError::fatal(anyhow!("Topic '{topic}' not found in metadata")))?;

        if let Some(code) = topic_metadata.error() {
            return Err(IngestError::fatal(anyhow!(
                "Broker reported error for topic '{topic}': {:?}",
                RDKafkaErrorCode::from(code)
            )));
        }

        let mut partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn subscribe(
        &mut self,
        topic: &str,
        partition: i32,
        start: StartingPoint,
    ) -> Result<(), IngestError> {
        let offset = match start {
            StartingPoint::Earliest => Offset::Beginning,
            StartingPoint::Latest => Offset::End,
            StartingPoint::Resume(next) => Offset::Offset(next),
        };

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, offset)
            .and_then(|_| self.consumer.assign(&assignment))
            .map_err(|e| IngestError::Subscribe {
                topic: topic.to_string(),
                partition,
                source: e.into(),
            })?;

        info!(
            topic = topic,
            partition = partition,
            start = %start,
            "Assigned Kafka partition"
        );
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<SourceMessage, IngestError>> {
        match self.consumer.recv().await {
            Ok(message) => Some(Ok(SourceMessage::new(
                Partition::new(message.topic().to_owned(), message.partition()),
                message.offset(),
                message.payload().map(<[u8]>::to_vec),
            ))),
            Err(e) => Some(Err(classify_kafka_error(e))),
        }
    }

    async fn commit(&mut self, cursor: &Cursor) -> Result<(), IngestError> {
        if cursor.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (&partition, &next_offset) in cursor.offsets() {
            list.add_partition_offset(cursor.topic(), partition, Offset::Offset(next_offset))
                .map_err(|e| IngestError::Commit { source: e.into() })?;
        }

        // async commit: the sink cursor is authoritative, this only feeds lag reporting
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| IngestError::Commit { source: e.into() })
    }
}

/// Sort a consumer error into transient (retry the poll) or fatal (stop the worker).
pub fn classify_kafka_error(e: KafkaError) -> IngestError {
    match &e {
        KafkaError::MessageConsumption(code) => {
            let label = match code {
                RDKafkaErrorCode::PartitionEOF => "partition_eof",
                RDKafkaErrorCode::OperationTimedOut => "op_timed_out",
                RDKafkaErrorCode::OffsetOutOfRange => {
                    // "auto.offset.reset" will trigger a seek to head or tail
                    // of the partition in coordination with the broker
                    warn!("Offset out of range - seeking to configured offset reset policy");
                    "offset_out_of_range"
                }
                _ => {
                    warn!("Kafka consumer error: {code:?}");
                    "consumer"
                }
            };
            metrics::counter!(INGEST_TRANSPORT_ERRORS, &[("level", "warn"), ("error", label)])
                .increment(1);
            IngestError::transient(e)
        }

        KafkaError::MessageConsumptionFatal(code) => {
            error!("Fatal Kafka consumer error: {code:?}");
            metrics::counter!(
                INGEST_TRANSPORT_ERRORS,
                &[("level", "fatal"), ("error", "consumer")]
            )
            .increment(1);
            IngestError::fatal(e)
        }

        // Connection issues
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::Authentication => {
                error!("Authentication failed: {code:?}");
                metrics::counter!(
                    INGEST_TRANSPORT_ERRORS,
                    &[("level", "fatal"), ("error", "authentication")]
                )
                .increment(1);
                IngestError::fatal(e)
            }
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                warn!("Broker unavailable: {code:?} - waiting for reconnect");
                metrics::counter!(
                    INGEST_TRANSPORT_ERRORS,
                    &[("level", "warn"), ("error", "broker_unavailable")]
                )
                .increment(1);
                IngestError::transient(e)
            }
            _ => {
                warn!("Global Kafka error: {code:?}");
                metrics::counter!(
                    INGEST_TRANSPORT_ERRORS,
                    &[("level", "warn"), ("error", "global")]
                )
                .increment(1);
                IngestError::transient(e)
            }
        },

        // Consumer was closed underneath us
        KafkaError::Canceled => {
            info!("Consumer canceled");
            metrics::counter!(
                INGEST_TRANSPORT_ERRORS,
                &[("level", "info"), ("error", "canceled")]
            )
            .increment(1);
            IngestError::fatal(e)
        }

        _ => {
            error!("Unexpected Kafka error: {e:?}");
            metrics::counter!(
                INGEST_TRANSPORT_ERRORS,
                &[("level", "warn"), ("error", "unexpected")]
            )
            .increment(1);
            IngestError::transient(e)
        }
    }
}
