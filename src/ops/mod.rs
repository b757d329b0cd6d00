//! Operational concerns.
//!
//! - `metrics` - In-process counters, gauges and histograms
//! - `telemetry` - Tracing setup and the metrics/health HTTP endpoint

pub mod metrics;
pub mod telemetry;

pub use metrics::MetricsRegistry;
pub use telemetry::*;
