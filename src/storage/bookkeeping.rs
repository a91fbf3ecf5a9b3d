//! Bookkeeping interface for jobs, artifacts and metrics.
//!
//! Every operation is atomic with respect to a single job row. Nothing in
//! the orchestration core relies on consistency across jobs.

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Artifact, ArtifactKind, Job, JobFilter, JobStatus, Metric, ProducedArtifact};
use crate::pipeline::PipelineKind;

use super::migrations::MigrationError;

/// Default page size for [`JobStore::list_jobs`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Errors that can occur during bookkeeping operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Job does not exist.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored row could not be mapped back to a record.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// The database was unreachable or overloaded; the call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) => true,
            StoreError::QueryFailed(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Persistence for job records and their outputs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a job in the `Created` state.
    async fn create_job(
        &self,
        pipeline: PipelineKind,
        config: serde_json::Value,
        input_locator: Option<String>,
    ) -> Result<Job, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, newest first.
    async fn list_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Applies a status change through [`Job::apply_transition`].
    ///
    /// Returns the updated job, or `None` when the job does not exist or the
    /// edge is illegal. Illegal edges are logged, never raised.
    async fn transition_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<Job>, StoreError>;

    async fn add_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        locator: &str,
        size_bytes: u64,
    ) -> Result<Artifact, StoreError>;

    async fn add_metric(&self, job_id: &str, name: &str, value: f64)
        -> Result<Metric, StoreError>;

    /// Replaces every artifact and metric of a job in one atomic write.
    ///
    /// Either all rows land or none do, and calling it again with the same
    /// outputs leaves the same rows behind.
    async fn record_outputs(
        &self,
        job_id: &str,
        artifacts: &[ProducedArtifact],
        metrics: &[(String, f64)],
    ) -> Result<(), StoreError>;

    /// Records the locator of the job's primary input.
    async fn set_input(&self, id: &str, locator: &str) -> Result<(), StoreError>;

    /// Records the identifier of the dispatched task.
    async fn set_task_handle(&self, id: &str, handle: &str) -> Result<(), StoreError>;

    /// Increments the retry counter and returns the new value.
    async fn increment_retry(&self, id: &str) -> Result<u32, StoreError>;

    async fn list_artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, StoreError>;

    async fn list_metrics(&self, job_id: &str) -> Result<Vec<Metric>, StoreError>;

    /// Deletes a job with its artifacts and metrics. Returns false if absent.
    async fn delete_job(&self, id: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::ConnectionFailed("refused".to_string()).is_transient());
        assert!(StoreError::QueryFailed(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::QueryFailed(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::NotFound("job-1".to_string()).is_transient());
    }
}
