//! Prometheus metrics registration and export.
//!
//! All metrics live in one registry held in `OnceLock` statics. Recording
//! before [`init_metrics`] is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all fold_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a final status, labeled by status and pipeline.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage and outcome.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Automatic retries of transient failures, labeled by reason.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of tasks waiting in a queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of pipeline runs currently executing.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are no-ops.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new(
            "fold_forge_jobs_total",
            "Total number of jobs that reached a final status",
        ),
        &["status", "pipeline"],
    )?;

    // Stages run for minutes to hours.
    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "fold_forge_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![
            30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 10800.0,
        ]),
        &["stage", "outcome"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new(
            "fold_forge_retries_total",
            "Automatic retries of transient failures",
        ),
        &["reason"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("fold_forge_queue_depth", "Number of tasks in queue"),
        &["queue_name"],
    )?;

    let jobs_in_progress = Gauge::new(
        "fold_forge_jobs_in_progress",
        "Number of pipeline runs currently executing",
    )?;

    let active_workers = Gauge::new("fold_forge_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_never_empty() {
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&["design", "success"])
                .observe(42.0);
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("fold_forge_stage_duration_seconds"));
    }
}
