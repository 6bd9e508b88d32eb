use std::time::Duration;

use thiserror::Error;

use crate::ingest::IngestError;
use crate::reference::LoadError;
use crate::sink::WriteError;

/// Errors that stop a partition worker, or the whole service.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to load reference data")]
    Load(#[from] LoadError),

    #[error("ingestion failed on partition {partition}")]
    Ingest { partition: i32, source: IngestError },

    #[error("sink failed on partition {partition}")]
    Write { partition: i32, source: WriteError },

    #[error("worker for partition {partition} died: {message}")]
    Worker { partition: i32, message: String },

    #[error("workers did not drain within {0:?}")]
    DrainTimeout(Duration),
}

impl PipelineError {
    /// Stable tag for logs and the process exit code
    pub fn error_class(&self) -> &'static str {
        match self {
            PipelineError::Load(_) => "load",
            PipelineError::Ingest { .. } => "ingest",
            PipelineError::Write { .. } => "write",
            PipelineError::Worker { .. } => "worker",
            PipelineError::DrainTimeout(_) => "drain_timeout",
        }
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::Load(e) => e.error_type(),
            PipelineError::Ingest { source, .. } => source.error_type(),
            PipelineError::Write { source, .. } => source.error_type(),
            PipelineError::Worker { .. } => "panic",
            PipelineError::DrainTimeout(_) => "timeout",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.error_class() {
            "load" => 2,
            "ingest" => 3,
            "write" => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_exit_codes_follow_error_class() {
        let load = PipelineError::Load(LoadError::MissingColumn {
            table: "hospital".to_string(),
            column: "date",
        });
        assert_eq!((load.error_class(), load.exit_code()), ("load", 2));

        let ingest = PipelineError::Ingest {
            partition: 0,
            source: IngestError::fatal(anyhow!("auth")),
        };
        assert_eq!((ingest.error_class(), ingest.exit_code()), ("ingest", 3));

        let worker = PipelineError::Worker {
            partition: 1,
            message: "panicked".to_string(),
        };
        assert_eq!(worker.exit_code(), 1);
        assert_eq!(PipelineError::DrainTimeout(Duration::from_secs(1)).exit_code(), 1);
    }
}
