//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job outcomes, stage durations, retries, poller health and slot
//! occupancy.
//!
//! # Example
//!
//! ```ignore
//! use contentforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_retry();
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
