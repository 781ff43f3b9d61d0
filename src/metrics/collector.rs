//! Metrics Collector

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use super::MetricsSink;
use crate::relay::RelayOutcome;

/// Prometheus-backed metrics sink.
///
/// Counters live in a private registry so several collectors (for instance
/// one per test) never collide.
pub struct RelayMetrics {
    registry: Registry,
    bytes_received_total: IntCounter,
    bytes_sent_total: IntCounter,
    relays_started_total: IntCounter,
    relays_active: IntGauge,
    relay_outcomes_total: IntCounterVec,
    dial_failures_total: IntCounter,
}

impl RelayMetrics {
    /// Create and register all relay metrics
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let bytes_received_total = IntCounter::new(
            "bytes_received_total",
            "Total number of bytes received from clients.",
        )?;
        let bytes_sent_total = IntCounter::new(
            "bytes_sent_total",
            "Total number of bytes sent to clients.",
        )?;
        let relays_started_total = IntCounter::new(
            "relays_started_total",
            "Total number of relays started.",
        )?;
        let relays_active = IntGauge::new(
            "relays_active",
            "Number of relays currently copying data.",
        )?;
        let relay_outcomes_total = IntCounterVec::new(
            Opts::new("relay_outcomes_total", "Finished relays by outcome."),
            &["outcome"],
        )?;
        let dial_failures_total = IntCounter::new(
            "dial_failures_total",
            "Total number of failed far endpoint dials.",
        )?;

        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(relays_started_total.clone()))?;
        registry.register(Box::new(relays_active.clone()))?;
        registry.register(Box::new(relay_outcomes_total.clone()))?;
        registry.register(Box::new(dial_failures_total.clone()))?;

        Ok(Self {
            registry,
            bytes_received_total,
            bytes_sent_total,
            relays_started_total,
            relays_active,
            relay_outcomes_total,
            dial_failures_total,
        })
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received_total.get()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent_total.get()
    }

    pub fn relays_started(&self) -> u64 {
        self.relays_started_total.get()
    }

    pub fn relays_active(&self) -> i64 {
        self.relays_active.get()
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures_total.get()
    }

    pub fn outcomes(&self, label: &str) -> u64 {
        self.relay_outcomes_total.with_label_values(&[label]).get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}

impl MetricsSink for RelayMetrics {
    fn add_bytes_received(&self, bytes: usize) {
        self.bytes_received_total.inc_by(bytes as u64);
    }

    fn add_bytes_sent(&self, bytes: usize) {
        self.bytes_sent_total.inc_by(bytes as u64);
    }

    fn relay_started(&self) {
        self.relays_started_total.inc();
        self.relays_active.inc();
    }

    fn relay_finished(&self, outcome: &RelayOutcome) {
        self.relays_active.dec();
        self.relay_outcomes_total.with_label_values(&[outcome.label()]).inc();
    }

    fn add_dial_failure(&self) {
        self.dial_failures_total.inc();
    }
}
