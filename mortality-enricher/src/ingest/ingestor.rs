use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cursor::Cursor;
use crate::ingest::batch::{DecodeError, PolledBatch, SourcedEvent};
use crate::ingest::decoder::{DecodeErrorKind, RecordDecoder};
use crate::ingest::error::IngestError;
use crate::ingest::source::MessageSource;
use crate::ingest::types::{SourceMessage, StartingPoint};
use crate::metrics_consts::{
    INGEST_BATCH_COLLECTION_DURATION_MS, INGEST_DECODE_ERRORS, INGEST_DUPLICATE_OFFSETS_SKIPPED,
    INGEST_MESSAGES_RECEIVED,
};

/// Pulls micro-batches of decoded records off one partition of the input log.
pub struct StreamIngestor<S> {
    source: S,
    decoder: Arc<dyn RecordDecoder>,
    topic: String,
    partition: i32,
    default_start: StartingPoint,

    // highest offset seen per partition, used to drop redeliveries
    last_offsets: HashMap<i32, i64>,

    // transport error hit after part of a batch was collected;
    // surfaced on the next poll so the partial batch is not lost
    pending_error: Option<IngestError>,
    exhausted: bool,
}

impl<S: MessageSource> StreamIngestor<S> {
    pub fn new(
        source: S,
        decoder: Arc<dyn RecordDecoder>,
        topic: impl Into<String>,
        partition: i32,
        default_start: StartingPoint,
    ) -> Self {
        Self {
            source,
            decoder,
            topic: topic.into(),
            partition,
            default_start,
            last_offsets: HashMap::new(),
            pending_error: None,
            exhausted: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Attach to the input partition. `resume` is the next offset restored
    /// from the sink; without one the configured default starting point is used.
    pub async fn subscribe(&mut self, resume: Option<i64>) -> Result<StartingPoint, IngestError> {
        let start = resume.map_or(self.default_start, StartingPoint::Resume);
        self.source.subscribe(&self.topic, self.partition, start).await?;

        self.last_offsets.clear();
        if let Some(next) = resume {
            self.last_offsets.insert(self.partition, next - 1);
        }
        Ok(start)
    }

    /// Collect up to `max_records` messages, waiting at most `max_wait`.
    ///
    /// Returns early with whatever was collected when `shutdown` fires or the
    /// source ends. Undecodable messages are returned as [`DecodeError`]s in
    /// the batch and their offsets still count as consumed.
    pub async fn poll_batch(
        &mut self,
        max_records: usize,
        max_wait: Duration,
        shutdown: &CancellationToken,
    ) -> Result<PolledBatch, IngestError> {
        if let Some(error) = self.pending_error.take() {
            return Err(error);
        }

        let mut batch = PolledBatch::new_with_size_hint(max_records);
        if self.exhausted {
            batch.mark_source_exhausted();
            return Ok(batch);
        }

        let start = Instant::now();
        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);

        while batch.message_count() < max_records {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    batch.mark_shutdown_requested();
                    break;
                }

                _ = &mut deadline => break,

                next = self.source.next_message() => match next {
                    Some(Ok(message)) => self.accept(message, &mut batch),
                    Some(Err(error)) => {
                        if batch.message_count() == 0 {
                            return Err(error);
                        }
                        debug!(
                            partition = self.partition,
                            collected = batch.message_count(),
                            "Transport error mid-batch, returning partial batch first"
                        );
                        self.pending_error = Some(error);
                        break;
                    }
                    None => {
                        debug!(partition = self.partition, "Input stream ended");
                        self.exhausted = true;
                        batch.mark_source_exhausted();
                        break;
                    }
                },
            }
        }

        metrics::histogram!(INGEST_BATCH_COLLECTION_DURATION_MS)
            .record(start.elapsed().as_millis() as f64);
        Ok(batch)
    }

    /// Best-effort transport-side commit of durably written offsets.
    pub async fn commit(&mut self, cursor: &Cursor) -> Result<(), IngestError> {
        self.source.commit(cursor).await
    }

    fn accept(&mut self, message: SourceMessage, batch: &mut PolledBatch) {
        let partition_number = message.partition.partition_number();
        if let Some(&last) = self.last_offsets.get(&partition_number) {
            if message.offset <= last {
                debug!(
                    partition = partition_number,
                    offset = message.offset,
                    last_seen = last,
                    "Skipping redelivered message"
                );
                metrics::counter!(INGEST_DUPLICATE_OFFSETS_SKIPPED).increment(1);
                return;
            }
        }
        self.last_offsets.insert(partition_number, message.offset);

        let decoded = match message.payload.as_deref() {
            Some(payload) => self.decoder.decode(payload),
            None => Err(DecodeErrorKind::EmptyPayload),
        };

        match decoded {
            Ok(event) => {
                metrics::counter!(INGEST_MESSAGES_RECEIVED, "status" => "success").increment(1);
                batch.push_event(SourcedEvent {
                    partition: message.partition,
                    offset: message.offset,
                    event,
                });
            }
            Err(kind) => {
                warn!(
                    partition = partition_number,
                    offset = message.offset,
                    error = %kind,
                    "Failed to decode message"
                );
                metrics::counter!(INGEST_MESSAGES_RECEIVED, "status" => "error").increment(1);
                metrics::counter!(INGEST_DECODE_ERRORS, "error" => kind.error_type()).increment(1);
                batch.push_error(DecodeError::new(kind, message.partition, message.offset));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;
    use crate::ingest::decoder::CsvDecoder;
    use crate::ingest::memory::MemoryLog;
    use crate::ingest::types::Partition;

    const TOPIC: &str = "hospital_trends";

    fn ingestor_for(log: &MemoryLog) -> StreamIngestor<crate::ingest::memory::MemorySource> {
        StreamIngestor::new(
            log.source(),
            Arc::new(CsvDecoder),
            TOPIC,
            0,
            StartingPoint::Earliest,
        )
    }

    /// Replays a fixed script of transport results, then reports end of stream.
    struct ScriptedSource {
        script: VecDeque<Result<SourceMessage, IngestError>>,
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn subscribe(
            &mut self,
            _topic: &str,
            _partition: i32,
            _start: StartingPoint,
        ) -> Result<(), IngestError> {
            Ok(())
        }

        async fn next_message(&mut self) -> Option<Result<SourceMessage, IngestError>> {
            self.script.pop_front()
        }

        async fn commit(&mut self, _cursor: &Cursor) -> Result<(), IngestError> {
            Ok(())
        }
    }

    fn scripted(offset: i64, payload: &str) -> Result<SourceMessage, IngestError> {
        Ok(SourceMessage::new(
            Partition::new(TOPIC.to_string(), 0),
            offset,
            Some(payload.as_bytes().to_vec()),
        ))
    }

    #[tokio::test]
    async fn test_batch_fills_to_max_records() {
        let log = MemoryLog::new(TOPIC);
        for count in 1..=5 {
            log.append(0, format!("Jan-24,ER,A,S,F,{count}"));
        }
        let mut ingestor = ingestor_for(&log);
        ingestor.subscribe(None).await.unwrap();

        let shutdown = CancellationToken::new();
        let batch = ingestor
            .poll_batch(3, Duration::from_secs(5), &shutdown)
            .await
            .unwrap();

        assert_eq!(batch.event_count(), 3);
        assert_eq!(batch.offsets().get(&0), Some(&3));
        assert!(!batch.shutdown_requested());
    }

    #[tokio::test]
    async fn test_timeout_returns_empty_batch() {
        let log = MemoryLog::new(TOPIC);
        let mut ingestor = ingestor_for(&log);
        ingestor.subscribe(None).await.unwrap();

        let batch = ingestor
            .poll_batch(10, Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_decode_failures_stay_in_batch_and_advance_offsets() {
        let log = MemoryLog::new(TOPIC);
        log.append(0, "Jan-24,ER,A,S,F,10");
        log.append(0, "not,a,record");
        log.append_empty(0);
        log.append(0, "Feb-24,ER,A,S,F,4");

        let mut ingestor = ingestor_for(&log);
        ingestor.subscribe(None).await.unwrap();
        let batch = ingestor
            .poll_batch(4, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch.event_count(), 2);
        assert_eq!(batch.error_count(), 2);
        assert_eq!(batch.errors()[0].offset(), 1);
        assert!(matches!(
            batch.errors()[1].kind(),
            DecodeErrorKind::EmptyPayload
        ));
        assert_eq!(batch.offsets().get(&0), Some(&4));
    }

    #[tokio::test]
    async fn test_resume_skips_already_consumed_offsets() {
        let source = ScriptedSource {
            script: VecDeque::from(vec![
                scripted(4, "Jan-24,ER,A,S,F,1"),
                scripted(5, "Jan-24,ER,A,S,F,2"),
                scripted(5, "Jan-24,ER,A,S,F,2"),
                scripted(6, "Jan-24,ER,A,S,F,3"),
            ]),
        };
        let mut ingestor =
            StreamIngestor::new(source, Arc::new(CsvDecoder), TOPIC, 0, StartingPoint::Latest);
        assert_eq!(
            ingestor.subscribe(Some(5)).await.unwrap(),
            StartingPoint::Resume(5)
        );

        let batch = ingestor
            .poll_batch(10, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let offsets: Vec<i64> = batch.events().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![5, 6]);
        assert_eq!(batch.offsets().get(&0), Some(&7));
        assert!(batch.source_exhausted());
    }

    #[tokio::test]
    async fn test_transport_error_after_partial_batch_is_deferred() {
        let source = ScriptedSource {
            script: VecDeque::from(vec![
                scripted(0, "Jan-24,ER,A,S,F,1"),
                Err(IngestError::transient(anyhow!("broker down"))),
                scripted(1, "Jan-24,ER,A,S,F,2"),
            ]),
        };
        let mut ingestor =
            StreamIngestor::new(source, Arc::new(CsvDecoder), TOPIC, 0, StartingPoint::Earliest);
        ingestor.subscribe(None).await.unwrap();
        let shutdown = CancellationToken::new();

        let first = ingestor
            .poll_batch(10, Duration::from_secs(5), &shutdown)
            .await
            .unwrap();
        assert_eq!(first.event_count(), 1);

        let err = ingestor
            .poll_batch(10, Duration::from_secs(5), &shutdown)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let third = ingestor
            .poll_batch(10, Duration::from_secs(5), &shutdown)
            .await
            .unwrap();
        assert_eq!(third.event_count(), 1);
        assert_eq!(third.offsets().get(&0), Some(&2));
    }

    #[tokio::test]
    async fn test_shutdown_returns_partial_batch_promptly() {
        let log = MemoryLog::new(TOPIC);
        log.append(0, "Jan-24,ER,A,S,F,10");
        let mut ingestor = ingestor_for(&log);
        ingestor.subscribe(None).await.unwrap();

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let batch = ingestor
            .poll_batch(100, Duration::from_secs(30), &shutdown)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(batch.shutdown_requested());
        assert_eq!(batch.event_count(), 1);
    }
}
