//! Caller-facing job operations: create, upload, submit and read results.
//!
//! `JobService` is the boundary where caller input is validated. Anything
//! rejected here never reaches the dispatcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{ObjectStoreError, ValidationError};
use crate::job::{ArtifactKind, Job, JobFilter, JobStatus, Metric};
use crate::pipeline::PipelineKind;
use crate::scheduler::{DispatchError, Dispatcher};
use crate::storage::{input_locator, JobStore, ObjectStore, StoreError, DEFAULT_URL_TTL};

/// Accepted input file extensions.
pub const INPUT_EXTENSIONS: [&str; 3] = ["pdb", "cif", "ent"];

/// Errors returned by [`JobService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job {0} not found")]
    JobNotFound(String),

    /// The operation does not apply to the job's current status.
    #[error("Cannot {operation} job {job_id} while {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Bookkeeping error: {0}")]
    Store(#[from] StoreError),

    #[error("Object storage error: {0}")]
    Objects(#[from] ObjectStoreError),
}

/// One downloadable output of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactLink {
    pub kind: ArtifactKind,
    pub locator: String,
    pub size_bytes: u64,
    pub url: String,
}

/// Results of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResults {
    pub job_id: String,
    pub status: JobStatus,
    pub artifacts: Vec<ArtifactLink>,
    pub metrics: Vec<Metric>,
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    dispatcher: Arc<Dispatcher>,
    max_input_bytes: u64,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        dispatcher: Arc<Dispatcher>,
        max_input_bytes: u64,
    ) -> Self {
        Self {
            store,
            objects,
            dispatcher,
            max_input_bytes,
        }
    }

    async fn load(&self, job_id: &str) -> Result<Job, ServiceError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    /// Creates a job record for the selected pipeline.
    ///
    /// `config` is stored verbatim; `null` stands for an empty object.
    pub async fn create_job(
        &self,
        pipeline_type: &str,
        selected_models: &[String],
        config: serde_json::Value,
    ) -> Result<Job, ServiceError> {
        let pipeline = PipelineKind::parse(pipeline_type, selected_models)?;
        let config = match config {
            serde_json::Value::Null => serde_json::json!({}),
            value @ serde_json::Value::Object(_) => value,
            _ => return Err(ValidationError::InvalidConfig.into()),
        };

        let job = self.store.create_job(pipeline, config, None).await?;
        info!(job_id = %job.id, pipeline = job.pipeline.name(), "Job created");
        Ok(job)
    }

    /// Stores the primary input and moves the job to UPLOADED.
    pub async fn upload_input(
        &self,
        job_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Job, ServiceError> {
        validate_input(file_name, bytes.len() as u64, self.max_input_bytes)?;

        let job = self.load(job_id).await?;
        if job.status != JobStatus::Created {
            return Err(ServiceError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "upload input for",
            });
        }

        let size = bytes.len();
        let locator = self
            .objects
            .put(&input_locator(job_id, file_name), bytes)
            .await?;
        self.store.set_input(job_id, &locator).await?;

        let job = self
            .store
            .transition_status(job_id, JobStatus::Uploaded, None)
            .await?
            .ok_or_else(|| ServiceError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "upload input for",
            })?;

        info!(job_id, locator = %locator, size, "Input uploaded");
        Ok(job)
    }

    /// Queues the job; returns the task handle without waiting for the run.
    pub async fn submit(&self, job_id: &str) -> Result<String, ServiceError> {
        Ok(self.dispatcher.submit(job_id).await?)
    }

    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, ServiceError> {
        Ok(self.dispatcher.cancel(job_id).await?)
    }

    pub async fn retry(&self, job_id: &str) -> Result<String, ServiceError> {
        Ok(self.dispatcher.retry(job_id).await?)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, ServiceError> {
        self.load(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.list_jobs(filter, limit).await?)
    }

    /// Download links and metrics of a COMPLETED job.
    pub async fn results(
        &self,
        job_id: &str,
        ttl: Option<Duration>,
    ) -> Result<JobResults, ServiceError> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(ServiceError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "read results of",
            });
        }

        let ttl = ttl.unwrap_or(DEFAULT_URL_TTL);
        let mut artifacts = Vec::new();
        for artifact in self.store.list_artifacts(job_id).await? {
            let url = self.objects.presigned_url(&artifact.locator, ttl).await?;
            artifacts.push(ArtifactLink {
                kind: artifact.kind,
                locator: artifact.locator,
                size_bytes: artifact.size_bytes,
                url,
            });
        }

        Ok(JobResults {
            job_id: job.id,
            status: job.status,
            artifacts,
            metrics: self.store.list_metrics(job_id).await?,
        })
    }

    /// Removes the job's stored objects, then the job itself.
    ///
    /// Jobs owned by a worker cannot be deleted; cancel them first.
    pub async fn delete(&self, job_id: &str) -> Result<bool, ServiceError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_in_flight() || job.status == JobStatus::Queued {
            return Err(ServiceError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "delete",
            });
        }

        let mut locators: Vec<String> = self
            .store
            .list_artifacts(job_id)
            .await?
            .into_iter()
            .map(|artifact| artifact.locator)
            .collect();
        locators.extend(job.input_locator);

        for locator in &locators {
            if let Err(e) = self.objects.delete(locator).await {
                warn!(job_id, locator = %locator, error = %e, "Failed to delete object");
                return Err(e.into());
            }
        }

        let deleted = self.store.delete_job(job_id).await?;
        info!(job_id, objects = locators.len(), "Job deleted");
        Ok(deleted)
    }
}

/// Checks an upload before anything is stored.
pub fn validate_input(file_name: &str, size: u64, max_bytes: u64) -> Result<(), ValidationError> {
    let path = Path::new(file_name);
    let plain = path.file_name().and_then(|name| name.to_str()) == Some(file_name);
    if file_name.trim().is_empty() || !plain || file_name.contains('\\') {
        return Err(ValidationError::InvalidFileName(file_name.to_string()));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());
    if !extension.is_some_and(|ext| INPUT_EXTENSIONS.contains(&ext.as_str())) {
        return Err(ValidationError::UnsupportedFormat {
            file: file_name.to_string(),
            expected: INPUT_EXTENSIONS
                .iter()
                .map(|ext| format!(".{}", ext))
                .collect::<Vec<_>>()
                .join(", "),
        });
    }

    if size == 0 {
        return Err(ValidationError::EmptyInput(file_name.to_string()));
    }

    if size > max_bytes {
        return Err(ValidationError::InputTooLarge {
            file: file_name.to_string(),
            size,
            limit: max_bytes,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::scheduler::MemoryTaskQueue;
    use crate::storage::{LocalObjectStore, MemoryJobStore};

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryJobStore>,
        objects: Arc<LocalObjectStore>,
        service: JobService,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(LocalObjectStore::new(
            dir.path(),
            "http://files.local/objects",
            "secret",
        ));
        let queue = Arc::new(MemoryTaskQueue::default());
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), queue));
        let service = JobService::new(store.clone(), objects.clone(), dispatcher, 1024);
        Fixture {
            _dir: dir,
            store,
            objects,
            service,
        }
    }

    #[test]
    fn test_validate_input() {
        assert!(validate_input("target.pdb", 10, 100).is_ok());
        assert!(validate_input("TARGET.CIF", 10, 100).is_ok());
        assert!(matches!(
            validate_input("target.txt", 10, 100),
            Err(ValidationError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            validate_input("target.pdb", 0, 100),
            Err(ValidationError::EmptyInput(_))
        ));
        assert!(matches!(
            validate_input("target.pdb", 101, 100),
            Err(ValidationError::InputTooLarge { .. })
        ));
        assert!(matches!(
            validate_input("../target.pdb", 10, 100),
            Err(ValidationError::InvalidFileName(_))
        ));
        assert!(matches!(
            validate_input("pdb", 10, 100),
            Err(ValidationError::UnsupportedFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_upload_submit() {
        let f = fixture();
        let job = f
            .service
            .create_job("full_chain", &["af2".to_string()], serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.config, serde_json::json!({}));

        let job = f
            .service
            .upload_input(&job.id, "target.pdb", b"ATOM".to_vec())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
        let locator = job.input_locator.clone().unwrap();
        assert_eq!(f.objects.get(&locator).await.unwrap(), b"ATOM");

        let handle = f.service.submit(&job.id).await.unwrap();
        let queued = f.service.status(&job.id).await.unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.task_handle, Some(handle));
    }

    #[tokio::test]
    async fn test_rejected_upload_leaves_job_created() {
        let f = fixture();
        let job = f
            .service
            .create_job("design_only", &[], serde_json::json!({"num_designs": 2}))
            .await
            .unwrap();

        let err = f
            .service
            .upload_input(&job.id, "target.pdb", vec![0; 2048])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::InputTooLarge { .. })
        ));

        let stored = f.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Created);
        assert!(stored.input_locator.is_none());
    }

    #[tokio::test]
    async fn test_unknown_pipeline_and_bad_config() {
        let f = fixture();
        assert!(matches!(
            f.service.create_job("folding", &[], serde_json::Value::Null).await,
            Err(ServiceError::Validation(ValidationError::UnknownPipeline(_)))
        ));
        assert!(matches!(
            f.service.create_job("design_only", &[], serde_json::json!([1])).await,
            Err(ServiceError::Validation(ValidationError::InvalidConfig))
        ));
    }

    #[tokio::test]
    async fn test_results_only_for_completed_jobs() {
        let f = fixture();
        let job = f
            .service
            .create_job("prediction_only", &[], serde_json::Value::Null)
            .await
            .unwrap();

        let err = f.service.results(&job.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidState {
                status: JobStatus::Created,
                ..
            }
        ));

        for status in [
            JobStatus::Uploaded,
            JobStatus::Queued,
            JobStatus::Provisioning,
            JobStatus::Running,
            JobStatus::PostProcessing,
        ] {
            f.store.transition_status(&job.id, status, None).await.unwrap();
        }
        let locator = "jobs/x/prediction/model.pdb";
        f.objects.put(locator, b"ATOM".to_vec()).await.unwrap();
        f.store
            .add_artifact(&job.id, ArtifactKind::PredictedStructure, locator, 4)
            .await
            .unwrap();
        f.store.add_metric(&job.id, "plddt", 87.5).await.unwrap();
        f.store
            .transition_status(&job.id, JobStatus::Completed, None)
            .await
            .unwrap();

        let results = f
            .service
            .results(&job.id, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(results.artifacts.len(), 1);
        assert!(results.artifacts[0]
            .url
            .starts_with("http://files.local/objects/jobs/x/prediction/model.pdb?expires="));
        assert_eq!(results.metrics.len(), 1);
        assert_eq!(results.metrics[0].value, 87.5);
    }

    #[tokio::test]
    async fn test_delete_removes_objects() {
        let f = fixture();
        let job = f
            .service
            .create_job("design_only", &[], serde_json::Value::Null)
            .await
            .unwrap();
        let job = f
            .service
            .upload_input(&job.id, "target.pdb", b"ATOM".to_vec())
            .await
            .unwrap();
        let locator = job.input_locator.clone().unwrap();

        assert!(f.service.delete(&job.id).await.unwrap());
        assert!(f.objects.get(&locator).await.is_err());
        assert!(f.store.get_job(&job.id).await.unwrap().is_none());
        assert!(!f.service.delete(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_rejects_queued_job() {
        let f = fixture();
        let job = f
            .service
            .create_job("design_only", &[], serde_json::Value::Null)
            .await
            .unwrap();
        f.service
            .upload_input(&job.id, "target.pdb", b"ATOM".to_vec())
            .await
            .unwrap();
        f.service.submit(&job.id).await.unwrap();

        assert!(matches!(
            f.service.delete(&job.id).await,
            Err(ServiceError::InvalidState { .. })
        ));
    }
}
