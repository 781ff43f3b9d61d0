//! Metrics Sink

use crate::relay::RelayOutcome;

/// Receiver of relay byte counts and lifecycle events.
///
/// Calls are fire-and-forget: implementations must not block and must never
/// fail in a way the relay can observe.
pub trait MetricsSink: Send + Sync {
    /// Bytes read from a near endpoint and delivered to its far endpoint.
    fn add_bytes_received(&self, bytes: usize);

    /// Bytes read from a far endpoint and delivered to its near endpoint.
    fn add_bytes_sent(&self, bytes: usize);

    fn relay_started(&self) {}

    fn relay_finished(&self, _outcome: &RelayOutcome) {}

    fn add_dial_failure(&self) {}
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    #[inline]
    fn add_bytes_received(&self, _bytes: usize) {}

    #[inline]
    fn add_bytes_sent(&self, _bytes: usize) {}
}
