// Stream ingestion - transport seam, wire decoding and offset-tracked micro-batches
pub mod batch;
pub mod decoder;
pub mod error;
pub mod ingestor;
pub mod kafka;
pub mod kafka_config;
pub mod source;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod memory;

// Public API
pub use batch::{DecodeError, PolledBatch, SourcedEvent};
pub use decoder::{CsvDecoder, DecodeErrorKind, JsonDecoder, RecordDecoder, WireFormat};
pub use error::IngestError;
pub use ingestor::StreamIngestor;
pub use kafka::KafkaSource;
pub use kafka_config::ConsumerConfigBuilder;
pub use source::MessageSource;
pub use types::{Partition, SourceMessage, StartingPoint};
