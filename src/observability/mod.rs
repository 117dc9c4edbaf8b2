//! Logging setup and engine metrics.
//!
//! Everything in the crate logs through `tracing` with structured fields
//! (`session_id`, `generation`, `error`). Embedders that already install a
//! subscriber can ignore [`init_tracing`]; it is only a convenience.

mod logging;
mod metrics;

#[cfg(feature = "logging")]
pub use logging::init_tracing;
pub use logging::{LogFormat, LoggingConfig, LoggingError};
pub use metrics::{Counter, EngineMetrics, Gauge, MetricsSnapshot};
