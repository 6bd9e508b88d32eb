// Durable output - columnar batches committed together with the input cursor
pub mod checkpointed;
pub mod commit_log;
pub mod file_storage;
pub mod parquet;
pub mod storage;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod memory;

// Public API
pub use checkpointed::{Ack, CheckpointedSink, SinkRetryConfig, WriteError};
pub use commit_log::CommitRecord;
pub use file_storage::ParquetFileStorage;
pub use memory::{FailurePoint, MemoryStorage};
pub use storage::{BatchStorage, CommitRequest, RestoredState, StorageError};
