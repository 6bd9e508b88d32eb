use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::ingest::error::IngestError;
use crate::ingest::types::{SourceMessage, StartingPoint};

/// The publish/subscribe log the pipeline reads from.
///
/// `next_message` is raced against timers and the shutdown signal, so
/// implementations must be cancel safe: dropping the future before it
/// resolves must not lose a message.
#[async_trait]
pub trait MessageSource: Send {
    /// Attach to a single partition of `topic`, starting at `start`.
    async fn subscribe(
        &mut self,
        topic: &str,
        partition: i32,
        start: StartingPoint,
    ) -> Result<(), IngestError>;

    /// Wait for the next message. `None` means the stream has ended.
    async fn next_message(&mut self) -> Option<Result<SourceMessage, IngestError>>;

    /// Record consumed offsets on the transport side. The sink cursor stays
    /// the source of truth for resumption; this keeps consumer-group lag
    /// reporting accurate.
    async fn commit(&mut self, cursor: &Cursor) -> Result<(), IngestError>;
}
