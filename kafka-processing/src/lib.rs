//! Processing lifecycle for Kafka consumers.
//!
//! Each assigned partition gets a runtime that delivers batches to application code,
//! lets that code pause, seek and resume the partition, escalates pauses through a
//! backoff policy and only reports offsets for work that actually completed. Batches
//! can run inline, as long-running jobs with the partition paused, or split into
//! virtual partitions processed concurrently.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` gives the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` gives the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors: they only show the top-level message and hide the chain.

pub mod config;
pub mod error;
pub mod jobs;
pub mod kafka;
pub mod metrics_consts;
pub mod processing;
pub mod service;

// Re-export commonly used types for convenience
pub use config::{Config, ProcessingSettings};
pub use error::ConfigError;
pub use processing::backoff::{BackoffPolicy, PAUSE_FOREVER};
pub use processing::context::{BatchContext, BatchProcessor};
pub use service::ProcessingService;
