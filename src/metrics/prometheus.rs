//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by contentforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all contentforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal status, labeled by status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage call duration in seconds, labeled by stage and outcome.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total retries scheduled.
pub static RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Jobs discovered by the readiness poller.
pub static JOBS_DISCOVERED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Readiness polls that failed because the job store errored.
pub static POLL_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of ready jobs waiting for a slot.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs holding an execution slot.
pub static ACTIVE_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again keeps the first set of metrics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("contentforge_jobs_total", "Jobs that reached a terminal status"),
        &["status"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "contentforge_stage_duration_seconds",
            "Pipeline stage duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
        &["stage", "outcome"],
    )?;

    let retries_total = Counter::new("contentforge_retries_total", "Total retries scheduled")?;

    // Scheduler metrics
    let jobs_discovered = Counter::new(
        "contentforge_jobs_discovered_total",
        "Jobs discovered by the readiness poller",
    )?;

    let poll_failures = Counter::new(
        "contentforge_poll_failures_total",
        "Readiness polls that failed on a job store error",
    )?;

    let queue_depth = Gauge::new(
        "contentforge_queue_depth",
        "Number of ready jobs waiting for a slot",
    )?;

    let active_jobs = Gauge::new(
        "contentforge_active_jobs",
        "Number of jobs holding an execution slot",
    )?;

    // Register all metrics with the registry
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(jobs_discovered.clone()))?;
    registry.register(Box::new(poll_failures.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_jobs.clone()))?;

    // If any of these fail, metrics were initialized concurrently (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = JOBS_DISCOVERED_TOTAL.set(jobs_discovered);
    let _ = POLL_FAILURES_TOTAL.set(poll_failures);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_JOBS.set(active_jobs);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
