//! Observability helpers: metrics facade wrapper and canonical structured log events.

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
