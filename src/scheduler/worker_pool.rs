//! Worker pool that runs pipeline tasks from a shared queue.
//!
//! Each worker is an independent tokio task that runs at most one pipeline at
//! a time. Around every run the worker:
//!
//! - enforces the per-job wall-clock limit, warning at a soft limit first
//! - polls the queue for cancel requests and fires the run's abort signal
//! - retries transient infrastructure failures with exponential backoff
//! - dead-letters tasks that ran out of attempts
//!
//! Shutdown is broadcast to all workers; each finishes its current run first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::execution::{AbortReason, AbortSignal};
use crate::job::JobStatus;
use crate::metrics::MetricsCollector;
use crate::pipeline::{PipelineError, PipelineOrchestrator, PipelineOutcome};
use crate::storage::{JobStore, StoreError};

use super::queue::{QueueError, TaskQueue};
use super::task::{backoff_delay, PipelineTask, DEFAULT_MAX_ATTEMPTS};

/// Error recorded for jobs whose worker vanished mid-run.
pub const WORKER_LOST_MESSAGE: &str = "worker lost during execution";

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Dequeue wait and cancel-flag polling period.
    pub poll_interval: Duration,
    /// Hard wall-clock limit for one pipeline run.
    pub job_timeout: Duration,
    /// How long before the hard limit the soft warning fires.
    pub soft_timeout_margin: Duration,
    /// Time the run gets to unwind after the hard limit fired.
    pub cleanup_grace: Duration,
    /// Attempts per task, first run included.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(10_800),
            soft_timeout_margin: Duration::from_secs(300),
            cleanup_grace: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_secs(60),
            max_retry_backoff: Duration::from_secs(900),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_soft_timeout_margin(mut self, margin: Duration) -> Self {
        self.soft_timeout_margin = margin;
        self
    }

    pub fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    /// Sets the retry budget; `max_retries` excludes the first run.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_attempts = max_retries + 1;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently running a pipeline.
    pub active_workers: usize,
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    pub tasks_dead_lettered: u64,
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Success rate over processed tasks, as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.tasks_processed == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / self.tasks_processed as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_processed(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let processed = self.processed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let average_task_duration = if processed > 0 {
            Duration::from_millis(total_duration_ms / processed)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_processed: processed,
            tasks_succeeded: self.succeeded.load(Ordering::SeqCst),
            tasks_failed: self.failed.load(Ordering::SeqCst),
            tasks_retried: self.retried.load(Ordering::SeqCst),
            tasks_cancelled: self.cancelled.load(Ordering::SeqCst),
            tasks_dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            average_task_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing tasks from a queue.
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: Arc::new(config),
            queue,
            orchestrator,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers orphaned tasks, then spawns the workers.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.recover_orphans().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, "Recovered tasks from processing queue");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to recover processing tasks"),
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                orchestrator: Arc::clone(&self.orchestrator),
                shutdown_rx: self.shutdown_tx.subscribe(),
                config: Arc::clone(&self.config),
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, queue = %self.queue.queue_name(), "Worker pool started");

        Ok(())
    }

    /// Requeues tasks left in the processing set by a crashed worker.
    ///
    /// Jobs caught mid-run are failed and moved back to QUEUED first.
    async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let store = self.orchestrator.store();
        let orphans = self.queue.recover_processing().await?;
        let mut recovered = 0;

        for mut task in orphans {
            let job_id = task.job_id.clone();
            match reset_for_retry(store.as_ref(), &job_id, WORKER_LOST_MESSAGE).await {
                Ok(true) => {
                    task.last_error = Some(WORKER_LOST_MESSAGE.to_string());
                    task.needs_reset = false;
                    self.queue.requeue(task, Duration::ZERO).await?;
                    recovered += 1;
                }
                Ok(false) => {
                    debug!(job_id = %job_id, "Orphaned task refers to a settled job, dropping");
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Could not reset orphaned job, requeueing for later reset");
                    task.needs_reset = true;
                    self.queue.requeue(task, self.config.retry_backoff).await?;
                    recovered += 1;
                }
            }
        }

        Ok(recovered)
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current run before stopping.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }
}

/// Moves a job back to QUEUED so its task can run again.
///
/// In-flight jobs are failed with `reason` first. Returns `false` when the job
/// is gone or settled in a way that must not be retried.
async fn reset_for_retry(
    store: &dyn JobStore,
    job_id: &str,
    reason: &str,
) -> Result<bool, StoreError> {
    let Some(job) = store.get_job(job_id).await? else {
        return Ok(false);
    };

    match job.status {
        // Already reset by an earlier attempt.
        JobStatus::Queued => return Ok(true),
        status if status.is_in_flight() => {
            store
                .transition_status(job_id, JobStatus::Failed, Some(reason))
                .await?;
        }
        JobStatus::Failed => {}
        _ => return Ok(false),
    }

    if store
        .transition_status(job_id, JobStatus::Queued, None)
        .await?
        .is_none()
    {
        return Ok(false);
    }
    store.increment_retry(job_id).await?;
    Ok(true)
}

/// A single worker that processes tasks from the queue.
pub struct Worker {
    id: String,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    config: Arc<WorkerPoolConfig>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop; runs until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.config.poll_interval).await {
                Ok(Some(task)) => {
                    self.process_task(task).await;
                    self.report_queue_depth().await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                    self.report_queue_depth().await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn report_queue_depth(&self) {
        if let Ok(stats) = self.queue.stats().await {
            self.metrics
                .update_queue_depth(self.queue.queue_name(), stats.backlog());
        }
    }

    /// Runs one task to a settled outcome.
    async fn process_task(&self, mut task: PipelineTask) {
        let job_id = task.job_id.clone();

        if task.needs_reset {
            let store = self.orchestrator.store();
            let reason = task
                .last_error
                .clone()
                .unwrap_or_else(|| WORKER_LOST_MESSAGE.to_string());
            match reset_for_retry(store.as_ref(), &job_id, &reason).await {
                Ok(true) => task.needs_reset = false,
                Ok(false) => {
                    debug!(worker_id = %self.id, job_id = %job_id, "Job settled before reset, dropping task");
                    self.ack(&task).await;
                    return;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Job reset still failing");
                    self.settle_transient(task, &e.to_string()).await;
                    return;
                }
            }
        }

        task.increment_attempts();
        info!(
            worker_id = %self.id,
            job_id = %job_id,
            task_id = %task.id,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            "Processing task"
        );

        let started = Instant::now();
        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();

        let signal = AbortSignal::new();
        let result = self.supervise(&job_id, &signal).await;

        self.metrics.dec_jobs_in_progress();
        self.stats.decrement_active();
        self.stats.record_processed(started.elapsed());

        self.settle(task, result).await;

        if let Err(e) = self.queue.clear_cancel(&job_id).await {
            debug!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to clear cancel flag");
        }
    }

    /// Runs the pipeline under the wall-clock limits and cancel polling.
    async fn supervise(
        &self,
        job_id: &str,
        signal: &AbortSignal,
    ) -> Result<PipelineOutcome, PipelineError> {
        let limit = self.config.job_timeout;
        let started = Instant::now();

        let run = self.orchestrator.run(job_id, signal);
        tokio::pin!(run);

        let soft = tokio::time::sleep_until(
            started + limit.saturating_sub(self.config.soft_timeout_margin),
        );
        let hard = tokio::time::sleep_until(started + limit);
        tokio::pin!(soft, hard);

        let mut cancel_poll = tokio::time::interval(self.config.poll_interval);
        cancel_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut soft_fired = false;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    warn!(
                        worker_id = %self.id,
                        job_id,
                        remaining_secs = self.config.soft_timeout_margin.min(limit).as_secs(),
                        "Job is approaching its time limit"
                    );
                }
                _ = &mut hard => break,
                _ = cancel_poll.tick(), if !signal.is_aborted() => {
                    match self.queue.is_cancel_requested(job_id).await {
                        Ok(true) => {
                            info!(worker_id = %self.id, job_id, "Cancel requested, aborting run");
                            signal.cancel();
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(worker_id = %self.id, job_id, error = %e, "Failed to poll cancel flag");
                        }
                    }
                }
            }
        }

        let seconds = limit.as_secs();
        warn!(worker_id = %self.id, job_id, seconds, "Job exceeded its time limit, aborting");
        signal.abort(AbortReason::TimedOut { seconds });

        match tokio::time::timeout(self.config.cleanup_grace, &mut run).await {
            Ok(result) => result,
            Err(_) => {
                error!(worker_id = %self.id, job_id, "Run did not unwind after abort, abandoning it");
                let err = PipelineError::Timeout { seconds };
                let message = err.to_string();
                match self
                    .orchestrator
                    .store()
                    .transition_status(job_id, JobStatus::Failed, Some(&message))
                    .await
                {
                    Ok(_) => {}
                    Err(e) => {
                        error!(worker_id = %self.id, job_id, error = %e, "Failed to record timeout")
                    }
                }
                Err(err)
            }
        }
    }

    /// Acknowledges, retries or dead-letters a finished run.
    async fn settle(&self, task: PipelineTask, result: Result<PipelineOutcome, PipelineError>) {
        let job_id = task.job_id.clone();

        match result {
            Ok(PipelineOutcome::Completed { artifacts, .. }) => {
                SharedPoolStats::bump(&self.stats.succeeded);
                info!(worker_id = %self.id, job_id = %job_id, artifacts, "Task completed");
                self.ack(&task).await;
            }
            Ok(PipelineOutcome::Skipped { status, .. }) => {
                debug!(worker_id = %self.id, job_id = %job_id, status = %status, "Task skipped");
                self.ack(&task).await;
            }
            Err(e) if e.is_cancelled() => {
                SharedPoolStats::bump(&self.stats.cancelled);
                self.ack(&task).await;
            }
            Err(e @ PipelineError::Superseded { .. }) => {
                debug!(worker_id = %self.id, job_id = %job_id, error = %e, "Task superseded");
                self.ack(&task).await;
            }
            Err(e) if e.is_transient() => {
                self.settle_transient(task, &e.to_string()).await;
            }
            Err(e) => {
                SharedPoolStats::bump(&self.stats.failed);
                warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Task failed");
                self.ack(&task).await;
            }
        }
    }

    /// Schedules another attempt after a transient failure, if any remain.
    async fn settle_transient(&self, mut task: PipelineTask, error: &str) {
        let job_id = task.job_id.clone();
        task.last_error = Some(error.to_string());

        if !task.should_retry() {
            SharedPoolStats::bump(&self.stats.failed);
            SharedPoolStats::bump(&self.stats.dead_lettered);
            error!(
                worker_id = %self.id,
                job_id = %job_id,
                attempts = task.attempts,
                error,
                "Task failed, moving to dead letter queue"
            );
            if let Err(e) = self.queue.dead_letter(task, error).await {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to move task to dead letter queue");
            }
            return;
        }

        let store = self.orchestrator.store();
        match reset_for_retry(store.as_ref(), &job_id, error).await {
            Ok(true) => task.needs_reset = false,
            Ok(false) => {
                info!(worker_id = %self.id, job_id = %job_id, "Job settled elsewhere, not retrying");
                self.ack(&task).await;
                return;
            }
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Could not requeue job yet, deferring reset");
                task.needs_reset = true;
            }
        }

        let delay = backoff_delay(
            self.config.retry_backoff,
            self.config.max_retry_backoff,
            task.attempts,
        );
        warn!(
            worker_id = %self.id,
            job_id = %job_id,
            error,
            remaining_attempts = task.remaining_attempts(),
            delay_secs = delay.as_secs(),
            "Task failed transiently, requeueing for retry"
        );

        SharedPoolStats::bump(&self.stats.retried);
        self.metrics.record_retry("transient");

        if let Err(e) = self.queue.requeue(task, delay).await {
            error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to requeue task");
        }
    }

    async fn ack(&self, task: &PipelineTask) {
        if let Err(e) = self.queue.complete(task).await {
            error!(
                worker_id = %self.id,
                job_id = %task.job_id,
                error = %e,
                "Failed to acknowledge task"
            );
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{ObjectStoreError, StageError};
    use crate::job::{Artifact, ArtifactKind, Job, JobFilter, Metric};
    use crate::pipeline::{PipelineKind, Stage};
    use crate::scheduler::MemoryTaskQueue;
    use crate::stages::{MetricValue, ProducedArtifact, StageExecutor, StageResult, StageSet};
    use crate::storage::MemoryJobStore;

    /// Fails transiently a fixed number of times, then succeeds.
    struct FlakyStage {
        stage: Stage,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyStage {
        fn new(stage: Stage, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                stage,
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StageExecutor for FlakyStage {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn execute(
            &self,
            job_id: &str,
            _input_locator: &str,
            _config: &serde_json::Value,
            _signal: &AbortSignal,
        ) -> Result<StageResult, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StageError::Storage {
                    stage: self.stage,
                    source: ObjectStoreError::Io(std::io::Error::other("disk unavailable")),
                });
            }

            let artifact = ProducedArtifact {
                kind: ArtifactKind::structure_for(self.stage),
                locator: format!("jobs/{}/{}/out.pdb", job_id, self.stage),
                size_bytes: 1,
            };
            let mut result = StageResult::succeeded(vec![artifact]);
            if self.stage.requires_metrics() {
                let mut metrics = BTreeMap::new();
                metrics.insert("plddt".to_string(), MetricValue::Number(90.0));
                result = result.with_metrics(metrics);
            }
            Ok(result)
        }
    }

    /// Blocks until aborted.
    struct HangingStage {
        stage: Stage,
    }

    #[async_trait]
    impl StageExecutor for HangingStage {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn execute(
            &self,
            _job_id: &str,
            _input_locator: &str,
            _config: &serde_json::Value,
            signal: &AbortSignal,
        ) -> Result<StageResult, StageError> {
            signal.aborted().await;
            Err(StageError::from_runner(self.stage, signal.runner_error()))
        }
    }

    fn stage_set(design: Arc<dyn StageExecutor>) -> StageSet {
        StageSet::new(
            design,
            FlakyStage::new(Stage::Backbone, 0),
            FlakyStage::new(Stage::Prediction, 0),
        )
    }

    async fn queued_job(store: &MemoryJobStore) -> Job {
        let job = Job::new(PipelineKind::default(), serde_json::json!({}))
            .with_input("jobs/x/inputs/target.pdb");
        store.insert(job.clone()).await;
        store
            .transition_status(&job.id, JobStatus::Uploaded, None)
            .await
            .unwrap();
        store
            .transition_status(&job.id, JobStatus::Queued, None)
            .await
            .unwrap()
            .unwrap()
    }

    /// Writes the first output batch, then reports the connection as lost.
    struct LostAckStore {
        inner: MemoryJobStore,
        drops: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for LostAckStore {
        async fn create_job(
            &self,
            pipeline: PipelineKind,
            config: serde_json::Value,
            input_locator: Option<String>,
        ) -> Result<Job, StoreError> {
            self.inner.create_job(pipeline, config, input_locator).await
        }

        async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
            self.inner.get_job(id).await
        }

        async fn list_jobs(
            &self,
            filter: &JobFilter,
            limit: usize,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.list_jobs(filter, limit).await
        }

        async fn transition_status(
            &self,
            id: &str,
            status: JobStatus,
            error: Option<&str>,
        ) -> Result<Option<Job>, StoreError> {
            self.inner.transition_status(id, status, error).await
        }

        async fn add_artifact(
            &self,
            job_id: &str,
            kind: ArtifactKind,
            locator: &str,
            size_bytes: u64,
        ) -> Result<Artifact, StoreError> {
            self.inner.add_artifact(job_id, kind, locator, size_bytes).await
        }

        async fn add_metric(
            &self,
            job_id: &str,
            name: &str,
            value: f64,
        ) -> Result<Metric, StoreError> {
            self.inner.add_metric(job_id, name, value).await
        }

        async fn record_outputs(
            &self,
            job_id: &str,
            artifacts: &[ProducedArtifact],
            metrics: &[(String, f64)],
        ) -> Result<(), StoreError> {
            self.inner.record_outputs(job_id, artifacts, metrics).await?;
            if !artifacts.is_empty() && self.drops.load(Ordering::SeqCst) > 0 {
                self.drops.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::ConnectionFailed("connection reset".to_string()));
            }
            Ok(())
        }

        async fn set_input(&self, id: &str, locator: &str) -> Result<(), StoreError> {
            self.inner.set_input(id, locator).await
        }

        async fn set_task_handle(&self, id: &str, handle: &str) -> Result<(), StoreError> {
            self.inner.set_task_handle(id, handle).await
        }

        async fn increment_retry(&self, id: &str) -> Result<u32, StoreError> {
            self.inner.increment_retry(id).await
        }

        async fn list_artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, StoreError> {
            self.inner.list_artifacts(job_id).await
        }

        async fn list_metrics(&self, job_id: &str) -> Result<Vec<Metric>, StoreError> {
            self.inner.list_metrics(job_id).await
        }

        async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_job(id).await
        }
    }

    fn worker(
        store: Arc<dyn JobStore>,
        queue: Arc<MemoryTaskQueue>,
        stages: StageSet,
        config: WorkerPoolConfig,
    ) -> Worker {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Worker {
            id: "worker-test".to_string(),
            queue,
            orchestrator: Arc::new(PipelineOrchestrator::new(store, stages)),
            shutdown_rx: rx,
            config: Arc::new(config),
            stats: Arc::new(SharedPoolStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig::new(1)
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_backoff(Duration::ZERO, Duration::ZERO)
    }

    async fn next_task(queue: &MemoryTaskQueue) -> PipelineTask {
        queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("task should be queued")
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 1);
        assert_eq!(config.job_timeout, Duration::from_secs(10_800));
        assert_eq!(config.soft_timeout_margin, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 4);
    }

    #[test]
    fn test_max_retries_counts_first_run() {
        let config = WorkerPoolConfig::new(2).with_max_retries(0);
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::default();
        stats.record_processed(Duration::from_secs(10));
        stats.record_processed(Duration::from_secs(20));
        SharedPoolStats::bump(&stats.succeeded);

        let pool_stats = stats.to_pool_stats(2);
        assert_eq!(pool_stats.tasks_processed, 2);
        assert_eq!(pool_stats.average_task_duration, Duration::from_secs(15));
        assert!((pool_stats.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_to_completion() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let design = FlakyStage::new(Stage::Design, 1);
        let worker = worker(store.clone(), queue.clone(), stage_set(design.clone()), fast_config());
        let job = queued_job(&store).await;

        queue.enqueue(PipelineTask::new(&job.id)).await.unwrap();
        worker.process_task(next_task(&queue).await).await;

        let after_failure = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(after_failure.status, JobStatus::Queued);
        assert_eq!(after_failure.retry_count, 1);
        assert_eq!(worker.stats.to_pool_stats(1).tasks_retried, 1);

        let retry = next_task(&queue).await;
        assert_eq!(retry.attempts, 1);
        assert!(retry.last_error.as_deref().unwrap().contains("disk unavailable"));
        worker.process_task(retry).await;

        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(design.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn test_retry_after_lost_output_write_records_outputs_once() {
        let store = Arc::new(LostAckStore {
            inner: MemoryJobStore::new(),
            drops: AtomicUsize::new(1),
        });
        let queue = Arc::new(MemoryTaskQueue::default());
        let worker = worker(
            store.clone(),
            queue.clone(),
            stage_set(FlakyStage::new(Stage::Design, 0)),
            fast_config(),
        );
        let job = queued_job(&store.inner).await;

        queue.enqueue(PipelineTask::new(&job.id)).await.unwrap();
        worker.process_task(next_task(&queue).await).await;

        let after_failure = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(after_failure.status, JobStatus::Queued);
        assert!(store.list_artifacts(&job.id).await.unwrap().is_empty());

        worker.process_task(next_task(&queue).await).await;

        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(store.list_artifacts(&job.id).await.unwrap().len(), 3);
        assert_eq!(store.list_metrics(&job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter_and_stay_failed() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let design = FlakyStage::new(Stage::Design, 5);
        let config = fast_config().with_max_retries(1);
        let worker = worker(store.clone(), queue.clone(), stage_set(design), config);
        let job = queued_job(&store).await;

        queue
            .enqueue(PipelineTask::new(&job.id).with_max_attempts(2))
            .await
            .unwrap();
        worker.process_task(next_task(&queue).await).await;
        worker.process_task(next_task(&queue).await).await;

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 1);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0.job_id, job.id);
        assert_eq!(worker.stats.to_pool_stats(1).tasks_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_cancel_flag_aborts_running_job() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let stages = stage_set(Arc::new(HangingStage {
            stage: Stage::Design,
        }));
        let worker = worker(store.clone(), queue.clone(), stages, fast_config());
        let job = queued_job(&store).await;

        queue.enqueue(PipelineTask::new(&job.id)).await.unwrap();
        queue.request_cancel(&job.id).await.unwrap();
        worker.process_task(next_task(&queue).await).await;

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(!queue.is_cancel_requested(&job.id).await.unwrap());
        assert_eq!(worker.stats.to_pool_stats(1).tasks_cancelled, 1);
    }

    #[tokio::test]
    async fn test_hard_limit_fails_job_with_timeout() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let stages = stage_set(Arc::new(HangingStage {
            stage: Stage::Design,
        }));
        let config = fast_config()
            .with_job_timeout(Duration::from_millis(50))
            .with_soft_timeout_margin(Duration::from_millis(20));
        let worker = worker(store.clone(), queue.clone(), stages, config);
        let job = queued_job(&store).await;

        queue.enqueue(PipelineTask::new(&job.id)).await.unwrap();
        worker.process_task(next_task(&queue).await).await;

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().starts_with("timeout"));
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_requeues_in_flight_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let job = queued_job(&store).await;
        store
            .transition_status(&job.id, JobStatus::Provisioning, None)
            .await
            .unwrap();

        queue.enqueue(PipelineTask::new(&job.id)).await.unwrap();
        let _orphan = next_task(&queue).await;

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            stage_set(FlakyStage::new(Stage::Design, 0)),
        ));
        let pool = WorkerPool::new(fast_config(), queue.clone(), orchestrator);
        assert_eq!(pool.recover_orphans().await.unwrap(), 1);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);

        let requeued = next_task(&queue).await;
        assert_eq!(requeued.last_error.as_deref(), Some(WORKER_LOST_MESSAGE));
    }

    #[tokio::test]
    async fn test_pool_start_and_shutdown() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            stage_set(FlakyStage::new(Stage::Design, 0)),
        ));
        let mut pool = WorkerPool::new(fast_config(), queue.clone(), orchestrator);
        let job = queued_job(&store).await;

        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));
        queue.enqueue(PipelineTask::new(&job.id)).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = store.get_job(&job.id).await.unwrap().unwrap().status;
            if status == JobStatus::Completed || Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }
}
