//! Metrics Module
//!
//! Byte counters and relay lifecycle metrics, plus their HTTP export.

pub mod collector;
pub mod server;
pub mod sink;

pub use collector::RelayMetrics;
pub use server::MetricsServer;
pub use sink::{MetricsSink, NoopMetrics};
