//! Mortality enricher service.
//!
//! Consumes hospital mortality events from a partitioned log, joins each one
//! against hospital and health-category reference tables, and appends the
//! enriched rows to Parquet output with exactly-once offset checkpoints.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message and hide the chain.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source. Avoid `anyhow!("...{e}")`, which formats the error into a string and drops the chain.

pub mod config;
pub mod cursor;
pub mod date;
pub mod error;
pub mod event;
pub mod health;
pub mod ingest;
pub mod join;
pub mod metrics_consts;
pub mod pipeline;
pub mod reference;
pub mod server;
pub mod service;
pub mod sink;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::PipelineError;
pub use event::{EnrichedRecord, RawEvent};
pub use pipeline::{Pipeline, PipelineConfig, RunSummary};
pub use service::{run_pipelines, EnricherService};
