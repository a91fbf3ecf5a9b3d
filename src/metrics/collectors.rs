//! Recording helpers over the global metrics.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, QUEUE_DEPTH, RETRIES_TOTAL, STAGE_DURATION,
};

/// Stateless handle for recording metrics with consistent labels.
///
/// ```ignore
/// use fold_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_stage("prediction", "success", 5423.0);
/// collector.record_job_finished("completed", "full_chain");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one stage execution.
    ///
    /// * `stage` - Stage name (e.g., "design", "prediction")
    /// * `outcome` - "success", "failure", "timeout" or "cancelled"
    /// * `duration_secs` - Wall-clock duration of the stage
    pub fn record_stage(&self, stage: &str, outcome: &str, duration_secs: f64) {
        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage, outcome])
                .observe(duration_secs);
        }

        tracing::trace!(stage, outcome, duration_secs, "Recorded stage metric");
    }

    /// Record a job reaching a final status.
    pub fn record_job_finished(&self, status: &str, pipeline: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status, pipeline]).inc();
        }
    }

    /// Record an automatic retry.
    pub fn record_retry(&self, reason: &str) {
        if let Some(retries_total) = RETRIES_TOTAL.get() {
            retries_total.with_label_values(&[reason]).inc();
        }
    }

    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(queue_name, depth, "Updated queue depth metric");
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
