// ==== Ingestion metrics ====
/// Histogram for time spent collecting one micro-batch from the transport
pub const INGEST_BATCH_COLLECTION_DURATION_MS: &str = "ingest_batch_collection_duration_ms";

/// Counter for messages received (with status label: success/error)
pub const INGEST_MESSAGES_RECEIVED: &str = "ingest_messages_received_total";

/// Counter for redelivered messages skipped because their offset was already seen
pub const INGEST_DUPLICATE_OFFSETS_SKIPPED: &str = "ingest_duplicate_offsets_skipped_total";

/// Counter for messages that could not be decoded (with error label)
pub const INGEST_DECODE_ERRORS: &str = "ingest_decode_errors_total";

/// Counter for transport errors (with level and error labels)
pub const INGEST_TRANSPORT_ERRORS: &str = "ingest_transport_errors_total";

/// Counter for polls retried after a transient transport error
pub const INGEST_POLL_RETRIES: &str = "ingest_poll_retries_total";

/// Counter for failed best-effort transport offset commits
pub const INGEST_COMMIT_FAILURES: &str = "ingest_commit_failures_total";

// ==== Reference data metrics ====
/// Gauge for rows held by a reference table (with table label)
pub const REFERENCE_ROWS_LOADED: &str = "reference_rows_loaded";

/// Counter for reference rows rejected while loading (with table label)
pub const REFERENCE_ROWS_REJECTED: &str = "reference_rows_rejected_total";

/// Counter for periodic reference reloads (with status label: success/failure)
pub const REFERENCE_REFRESHES: &str = "reference_refreshes_total";

// ==== Join metrics ====
/// Counter for lookup outcomes (with table and outcome labels: hit/miss/ambiguous)
pub const JOIN_LOOKUPS: &str = "join_lookups_total";

/// Counter for records dropped by the join (with error label)
pub const JOIN_ERRORS: &str = "join_errors_total";

// ==== Sink metrics ====
/// Histogram for the duration of one durable batch commit
pub const SINK_COMMIT_DURATION_MS: &str = "sink_commit_duration_ms";

/// Counter for enriched records durably written
pub const SINK_RECORDS_WRITTEN: &str = "sink_records_written_total";

/// Counter for commit attempts retried after a transient storage error
pub const SINK_COMMIT_RETRIES: &str = "sink_commit_retries_total";

/// Counter for commits that failed for good (with error label)
pub const SINK_COMMIT_FAILURES: &str = "sink_commit_failures_total";

/// Counter for uncommitted output files removed during restore
pub const SINK_ORPHANS_REMOVED: &str = "sink_orphans_removed_total";

/// Gauge for the last committed next-offset (with partition label)
pub const SINK_COMMITTED_OFFSET: &str = "sink_committed_offset";

// ==== Pipeline metrics ====
/// Counter for micro-batches processed end to end
pub const PIPELINE_BATCHES: &str = "pipeline_batches_total";

/// Histogram for events per processed micro-batch
pub const PIPELINE_BATCH_SIZE: &str = "pipeline_batch_size_events";

/// Histogram for end-to-end micro-batch processing time
pub const PIPELINE_BATCH_DURATION_MS: &str = "pipeline_batch_duration_ms";

/// Counter for coordinator state transitions (with state label)
pub const PIPELINE_STATE_TRANSITIONS: &str = "pipeline_state_transitions_total";
