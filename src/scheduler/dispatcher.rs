//! Producer side of the task queue: submit, cancel and retry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::job::{Job, JobStatus};
use crate::storage::{JobStore, StoreError};

use super::queue::{QueueError, TaskQueue};
use super::task::{PipelineTask, DEFAULT_MAX_ATTEMPTS};

/// Message recorded on jobs cancelled by an operator.
pub const CANCELLED_MESSAGE: &str = "cancelled by request";

/// Errors returned by dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Job {job_id} cannot be submitted while {status}")]
    NotSubmittable { job_id: String, status: JobStatus },

    #[error("Job {job_id} cannot be cancelled while {status}")]
    NotCancellable { job_id: String, status: JobStatus },

    #[error("Job {job_id} cannot be retried while {status}; only failed jobs can")]
    NotRetryable { job_id: String, status: JobStatus },

    #[error("Bookkeeping error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts per dispatched task, first run included.
    pub max_attempts: u32,
    /// How long a cancel waits for the worker to record CANCELLED.
    pub cancel_grace: Duration,
    /// Store polling period while waiting on a cancel.
    pub cancel_poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cancel_grace: Duration::from_secs(30),
            cancel_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Hands jobs to workers without waiting for their pipelines.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self::with_config(store, queue, DispatcherConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    async fn load(&self, job_id: &str) -> Result<Job, DispatchError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))
    }

    /// Queues an uploaded job and returns the task handle.
    pub async fn submit(&self, job_id: &str) -> Result<String, DispatchError> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Uploaded {
            return Err(DispatchError::NotSubmittable {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        self.enqueue_from(job_id, JobStatus::Uploaded).await
    }

    /// Re-queues a failed job. This is the manual operator entry point.
    pub async fn retry(&self, job_id: &str) -> Result<String, DispatchError> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(DispatchError::NotRetryable {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        let handle = self.enqueue_from(job_id, JobStatus::Failed).await?;
        let retry_count = self.store.increment_retry(job_id).await?;
        info!(job_id, retry_count, "Job re-queued by operator");
        Ok(handle)
    }

    /// Moves `job_id` to QUEUED and enqueues a fresh task for it.
    async fn enqueue_from(&self, job_id: &str, from: JobStatus) -> Result<String, DispatchError> {
        let Some(_) = self
            .store
            .transition_status(job_id, JobStatus::Queued, None)
            .await?
        else {
            let job = self.load(job_id).await?;
            return Err(match from {
                JobStatus::Failed => DispatchError::NotRetryable {
                    job_id: job_id.to_string(),
                    status: job.status,
                },
                _ => DispatchError::NotSubmittable {
                    job_id: job_id.to_string(),
                    status: job.status,
                },
            });
        };

        let task = PipelineTask::new(job_id).with_max_attempts(self.config.max_attempts);
        let handle = task.id.to_string();
        self.store.set_task_handle(job_id, &handle).await?;

        if let Err(e) = self.queue.enqueue(task).await {
            let message = format!("dispatch failed: {}", e);
            self.store
                .transition_status(job_id, JobStatus::Failed, Some(&message))
                .await?;
            return Err(e.into());
        }

        info!(job_id, task_handle = %handle, queue = %self.queue.queue_name(), "Job dispatched");
        Ok(handle)
    }

    /// Cancels a job and returns its final status.
    ///
    /// Jobs that have not started are cancelled directly. Running jobs get a
    /// cancel flag; the worker force-kills the container and records
    /// CANCELLED. If that does not happen within the grace period the
    /// dispatcher records CANCELLED itself without a confirmed kill. The
    /// flag stays set in that case, so a worker that is still alive kills
    /// the container on its next poll and only then clears the flag.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, DispatchError> {
        let job = self.load(job_id).await?;

        match job.status {
            JobStatus::Created | JobStatus::Uploaded | JobStatus::Queued => {
                if let Some(cancelled) = self
                    .store
                    .transition_status(job_id, JobStatus::Cancelled, Some(CANCELLED_MESSAGE))
                    .await?
                {
                    info!(job_id, from = %job.status, "Job cancelled before start");
                    return Ok(cancelled.status);
                }
                // A worker picked it up in the meantime.
                let current = self.load(job_id).await?;
                if !current.status.is_in_flight() || current.status == JobStatus::PostProcessing {
                    return Err(DispatchError::NotCancellable {
                        job_id: job_id.to_string(),
                        status: current.status,
                    });
                }
                self.cancel_running(job_id).await
            }
            JobStatus::Provisioning | JobStatus::Running => self.cancel_running(job_id).await,
            status => Err(DispatchError::NotCancellable {
                job_id: job_id.to_string(),
                status,
            }),
        }
    }

    async fn cancel_running(&self, job_id: &str) -> Result<JobStatus, DispatchError> {
        self.queue.request_cancel(job_id).await?;
        info!(job_id, grace_secs = self.config.cancel_grace.as_secs(), "Cancel requested");

        let deadline = Instant::now() + self.config.cancel_grace;
        loop {
            let job = self.load(job_id).await?;
            if job.status.is_finished() {
                return Ok(job.status);
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.cancel_poll_interval).await;
        }

        // The cancel flag is left in place for the worker to act on.
        warn!(
            job_id,
            grace_secs = self.config.cancel_grace.as_secs(),
            "Worker did not confirm cancel in time, recording CANCELLED with kill unconfirmed"
        );
        match self
            .store
            .transition_status(job_id, JobStatus::Cancelled, Some(CANCELLED_MESSAGE))
            .await?
        {
            Some(job) => Ok(job.status),
            None => {
                let job = self.load(job_id).await?;
                if job.status.is_finished() {
                    Ok(job.status)
                } else {
                    Err(DispatchError::NotCancellable {
                        job_id: job_id.to_string(),
                        status: job.status,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineKind;
    use crate::scheduler::MemoryTaskQueue;
    use crate::storage::MemoryJobStore;

    struct Fixture {
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryTaskQueue>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::default());
        let config = DispatcherConfig {
            max_attempts: 2,
            cancel_grace: Duration::from_millis(50),
            cancel_poll_interval: Duration::from_millis(5),
        };
        let dispatcher = Dispatcher::with_config(store.clone(), queue.clone(), config);
        Fixture {
            store,
            queue,
            dispatcher,
        }
    }

    async fn job_in(store: &MemoryJobStore, path: &[JobStatus]) -> Job {
        let job = Job::new(PipelineKind::default(), serde_json::json!({}))
            .with_input("jobs/x/inputs/target.pdb");
        store.insert(job.clone()).await;
        for status in path {
            store
                .transition_status(&job.id, *status, None)
                .await
                .unwrap()
                .expect("transition should apply");
        }
        store.get_job(&job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_submit_queues_and_records_handle() {
        let f = fixture();
        let job = job_in(&f.store, &[JobStatus::Uploaded]).await;

        let handle = f.dispatcher.submit(&job.id).await.unwrap();

        let stored = f.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.task_handle.as_deref(), Some(handle.as_str()));

        let task = f.queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(task.id.to_string(), handle);
        assert_eq!(task.max_attempts, 2);
    }

    #[tokio::test]
    async fn test_submit_requires_upload() {
        let f = fixture();
        let job = job_in(&f.store, &[]).await;

        let err = f.dispatcher.submit(&job.id).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NotSubmittable {
                status: JobStatus::Created,
                ..
            }
        ));
        assert_eq!(f.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_directly() {
        let f = fixture();
        let job = job_in(&f.store, &[JobStatus::Uploaded, JobStatus::Queued]).await;

        let status = f.dispatcher.cancel(&job.id).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);

        let stored = f.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(!f.queue.is_cancel_requested(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_rejected_for_settled_jobs() {
        let f = fixture();
        let completed = job_in(
            &f.store,
            &[
                JobStatus::Uploaded,
                JobStatus::Queued,
                JobStatus::Provisioning,
                JobStatus::Running,
                JobStatus::PostProcessing,
                JobStatus::Completed,
            ],
        )
        .await;
        let post = job_in(
            &f.store,
            &[
                JobStatus::Uploaded,
                JobStatus::Queued,
                JobStatus::Provisioning,
                JobStatus::Running,
                JobStatus::PostProcessing,
            ],
        )
        .await;

        for id in [&completed.id, &post.id] {
            let err = f.dispatcher.cancel(id).await.unwrap_err();
            assert!(matches!(err, DispatchError::NotCancellable { .. }));
        }
        assert_eq!(
            f.store.get_job(&completed.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_running_forces_status_after_grace() {
        let f = fixture();
        let job = job_in(
            &f.store,
            &[
                JobStatus::Uploaded,
                JobStatus::Queued,
                JobStatus::Provisioning,
                JobStatus::Running,
            ],
        )
        .await;

        let status = f.dispatcher.cancel(&job.id).await.unwrap();

        assert_eq!(status, JobStatus::Cancelled);
        let stored = f.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        // Left for a live worker to kill the container.
        assert!(f.queue.is_cancel_requested(&job.id).await.unwrap());

        let again = f.dispatcher.cancel(&job.id).await.unwrap_err();
        assert!(matches!(again, DispatchError::NotCancellable { .. }));
        assert!(f.queue.is_cancel_requested(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_running_waits_for_worker() {
        let f = fixture();
        let job = job_in(
            &f.store,
            &[
                JobStatus::Uploaded,
                JobStatus::Queued,
                JobStatus::Provisioning,
                JobStatus::Running,
            ],
        )
        .await;

        let store = f.store.clone();
        let job_id = job.id.clone();
        let worker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store
                .transition_status(&job_id, JobStatus::Cancelled, Some("killed by worker"))
                .await
                .unwrap();
        });

        let status = f.dispatcher.cancel(&job.id).await.unwrap();
        worker.await.unwrap();

        assert_eq!(status, JobStatus::Cancelled);
        let stored = f.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("killed by worker"));
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let f = fixture();
        let failed = job_in(
            &f.store,
            &[JobStatus::Uploaded, JobStatus::Queued, JobStatus::Failed],
        )
        .await;
        let queued = job_in(&f.store, &[JobStatus::Uploaded, JobStatus::Queued]).await;

        f.dispatcher.retry(&failed.id).await.unwrap();
        let stored = f.store.get_job(&failed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_message.is_none());

        let err = f.dispatcher.retry(&queued.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotRetryable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let f = fixture();
        let err = f.dispatcher.cancel("missing").await.unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound(_)));
    }
}
