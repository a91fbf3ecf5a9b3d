//! Pipeline orchestrator: drives one job through its stages.
//!
//! The orchestrator owns the status changes of a run. It moves a queued job
//! to RUNNING, executes the selected stages in order while handing the first
//! artifact of each stage to the next, persists outputs only once the job
//! has entered POST_PROCESSING, and records exactly one final status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{ObjectStoreError, StageError, ValidationError};
use crate::execution::{AbortReason, AbortSignal};
use crate::job::{Job, JobStatus};
use crate::metrics::MetricsCollector;
use crate::stages::{reduce_metrics, ProducedArtifact, StageResult, StageSet};
use crate::storage::{JobStore, ObjectStore, StoreError};

use super::selection::Stage;

/// Lines of stderr kept in a stage failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Errors that end a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Bookkeeping error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Stage(#[from] StageError),

    #[error("Object storage error: {0}")]
    Objects(#[from] ObjectStoreError),

    #[error("Job {0} not found")]
    JobNotFound(String),

    /// Another actor changed the job status first.
    #[error("Job {job_id} could not move to {target}; status changed concurrently")]
    Superseded { job_id: String, target: JobStatus },

    #[error("timeout: job exceeded {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Not a failure: the job was cancelled and recorded as CANCELLED.
    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: String },
}

impl PipelineError {
    /// Infrastructure trouble that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::Stage(e) => e.is_transient(),
            PipelineError::Objects(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
            || matches!(self, PipelineError::Stage(e) if e.is_cancelled())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Timeout { .. })
            || matches!(self, PipelineError::Stage(e) if e.is_timeout())
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed {
        job_id: String,
        artifacts: usize,
        metrics: usize,
    },
    /// The job was not QUEUED when the run started; nothing was changed.
    Skipped { job_id: String, status: JobStatus },
}

/// Snapshot of orchestrator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    skipped: AtomicU64,
}

/// Runs jobs through the stage executors.
pub struct PipelineOrchestrator {
    store: Arc<dyn JobStore>,
    stages: StageSet,
    objects: Option<Arc<dyn ObjectStore>>,
    metrics: MetricsCollector,
    counters: StatsCounters,
}

impl PipelineOrchestrator {
    pub fn new(store: Arc<dyn JobStore>, stages: StageSet) -> Self {
        Self {
            store,
            stages,
            objects: None,
            metrics: MetricsCollector::new(),
            counters: StatsCounters::default(),
        }
    }

    /// Object store that stage outputs are uploaded to.
    ///
    /// When set, the outputs of a run that does not complete are deleted
    /// from it.
    pub fn with_objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            started: self.counters.started.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Runs the pipeline of `job_id` to a final status.
    ///
    /// Only QUEUED jobs are run; any other status yields
    /// [`PipelineOutcome::Skipped`], which makes redelivery of a task
    /// harmless.
    ///
    /// # Errors
    ///
    /// Every error except `Superseded` and `JobNotFound` is preceded by
    /// exactly one transition to FAILED (or to CANCELLED for
    /// `PipelineError::Cancelled`).
    pub async fn run(
        &self,
        job_id: &str,
        signal: &AbortSignal,
    ) -> Result<PipelineOutcome, PipelineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Queued {
            info!(job_id, status = %job.status, "Job is not queued, skipping run");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(PipelineOutcome::Skipped {
                job_id: job.id,
                status: job.status,
            });
        }

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        let pipeline = job.pipeline.name();
        info!(job_id, pipeline, stages = ?job.stages(), "Starting pipeline run");

        let mut uploaded = Vec::new();
        let result = self.execute(&job, signal, &mut uploaded).await;
        if result.is_err() {
            self.discard_outputs(job_id, &uploaded).await;
        }

        match result {
            Ok(outcome) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_job_finished("completed", pipeline);
                Ok(outcome)
            }
            Err(e @ PipelineError::Superseded { .. }) => {
                warn!(job_id, error = %e, "Pipeline run superseded");
                Err(e)
            }
            Err(e) if e.is_cancelled() || aborted_by_cancel(signal) => {
                self.record_final(job_id, JobStatus::Cancelled, "cancelled by request")
                    .await;
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_job_finished("cancelled", pipeline);
                info!(job_id, "Pipeline run cancelled");
                Err(PipelineError::Cancelled {
                    job_id: job_id.to_string(),
                })
            }
            Err(e) => {
                self.record_final(job_id, JobStatus::Failed, &e.to_string())
                    .await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_job_finished("failed", pipeline);
                error!(job_id, error = %e, transient = e.is_transient(), "Pipeline run failed");
                Err(e)
            }
        }
    }

    /// Runs the stages and records their outputs.
    ///
    /// Every artifact a stage uploads is pushed to `uploaded` as soon as the
    /// stage returns, including stages whose result is then rejected.
    async fn execute(
        &self,
        job: &Job,
        signal: &AbortSignal,
        uploaded: &mut Vec<ProducedArtifact>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let input = job
            .input_locator
            .clone()
            .ok_or_else(|| ValidationError::MissingInput(job.id.clone()))?;

        self.advance(&job.id, JobStatus::Provisioning).await?;
        self.advance(&job.id, JobStatus::Running).await?;

        let stages = job.stages();
        let mut current_input = input;
        let mut final_metrics = None;

        for (index, stage) in stages.iter().copied().enumerate() {
            check_signal(&job.id, signal)?;

            let result = self
                .run_stage(job, stage, &current_input, signal)
                .await?;
            uploaded.extend(result.artifacts.iter().cloned());
            let result = check_stage_result(stage, result)?;

            // Produced artifacts are ordered; the first one feeds the next stage.
            if let Some(first) = result.artifacts.first() {
                current_input = first.locator.clone();
            }

            if index + 1 == stages.len() {
                final_metrics = result.metrics;
            }
        }

        self.advance(&job.id, JobStatus::PostProcessing).await?;

        let reduced = final_metrics
            .as_ref()
            .map(reduce_metrics)
            .unwrap_or_default();
        self.store
            .record_outputs(&job.id, uploaded.as_slice(), &reduced)
            .await?;

        self.advance(&job.id, JobStatus::Completed).await?;

        info!(
            job_id = %job.id,
            artifacts = uploaded.len(),
            metrics = reduced.len(),
            "Pipeline run completed"
        );

        Ok(PipelineOutcome::Completed {
            job_id: job.id.clone(),
            artifacts: uploaded.len(),
            metrics: reduced.len(),
        })
    }

    async fn run_stage(
        &self,
        job: &Job,
        stage: Stage,
        input: &str,
        signal: &AbortSignal,
    ) -> Result<StageResult, PipelineError> {
        let executor = self.stages.get(stage);
        info!(job_id = %job.id, stage = %stage, input, "Starting stage");

        let started = Instant::now();
        let result = executor.execute(&job.id, input, &job.config, signal).await;
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(r) if r.success => "success",
            Ok(_) => "failure",
            Err(e) if e.is_timeout() => "timeout",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "error",
        };
        self.metrics
            .record_stage(stage.as_str(), outcome, elapsed.as_secs_f64());
        info!(
            job_id = %job.id,
            stage = %stage,
            outcome,
            duration_secs = elapsed.as_secs_f64(),
            "Stage finished"
        );

        Ok(result?)
    }

    async fn advance(&self, job_id: &str, target: JobStatus) -> Result<Job, PipelineError> {
        let job = self
            .store
            .transition_status(job_id, target, None)
            .await?
            .ok_or_else(|| PipelineError::Superseded {
                job_id: job_id.to_string(),
                target,
            })?;
        debug!(job_id, status = %target, "Job status advanced");
        Ok(job)
    }

    /// Removes what a run that did not complete left behind.
    ///
    /// Recorded rows are cleared and uploaded objects deleted. Both are best
    /// effort; a failure is logged and the remaining objects still go.
    async fn discard_outputs(&self, job_id: &str, uploaded: &[ProducedArtifact]) {
        if uploaded.is_empty() {
            return;
        }
        if let Err(e) = self.store.record_outputs(job_id, &[], &[]).await {
            warn!(job_id, error = %e, "Failed to clear recorded outputs");
        }

        let Some(objects) = &self.objects else {
            return;
        };
        for artifact in uploaded {
            if let Err(e) = objects.delete(&artifact.locator).await {
                warn!(job_id, locator = %artifact.locator, error = %e, "Failed to delete stage output");
            }
        }
        debug!(job_id, count = uploaded.len(), "Discarded stage outputs");
    }

    /// Writes the final status of a run that did not complete.
    async fn record_final(&self, job_id: &str, status: JobStatus, message: &str) {
        match self
            .store
            .transition_status(job_id, status, Some(message))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(job_id, status = %status, "Final status already recorded elsewhere"),
            Err(e) => error!(job_id, status = %status, error = %e, "Failed to record final status"),
        }
    }
}

fn aborted_by_cancel(signal: &AbortSignal) -> bool {
    signal.reason() == Some(AbortReason::Cancelled)
}

fn check_signal(job_id: &str, signal: &AbortSignal) -> Result<(), PipelineError> {
    match signal.reason() {
        None => Ok(()),
        Some(AbortReason::TimedOut { seconds }) => Err(PipelineError::Timeout { seconds }),
        Some(AbortReason::Cancelled) => Err(PipelineError::Cancelled {
            job_id: job_id.to_string(),
        }),
    }
}

/// Turns an unusable stage result into the matching error.
fn check_stage_result(stage: Stage, result: StageResult) -> Result<StageResult, StageError> {
    if !result.success {
        return Err(StageError::Failed {
            stage,
            exit_code: result.exit_code,
            stderr: tail_lines(&result.logs, STDERR_TAIL_LINES),
        });
    }
    if stage.requires_metrics() && result.metrics.is_none() {
        return Err(StageError::MissingMetrics { stage });
    }
    if result.artifacts.is_empty() {
        return Err(StageError::NoArtifacts { stage });
    }
    Ok(result)
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    if lines.is_empty() {
        return "no error output".to_string();
    }
    lines[lines.len().saturating_sub(count)..].join("\n")
}
