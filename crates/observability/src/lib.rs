//! Tracing, logging, metrics (shared setup).

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Counters, gauges and latency histograms.
pub mod metrics;

/// Prometheus text exposition.
pub mod prometheus;

pub use metrics::{HistogramSnapshot, LatencyHistogram, MetricsCollector, MetricsSnapshot};
pub use prometheus::PrometheusExporter;
