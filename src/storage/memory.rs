//! In-process job store.
//!
//! An arena of job records keyed by identifier. Each record owns its
//! artifacts and metrics, so deleting a job drops them too. Used by tests
//! and by the CLI's `--in-memory` mode.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::job::{Artifact, ArtifactKind, Job, JobFilter, JobStatus, Metric, ProducedArtifact};
use crate::pipeline::PipelineKind;

use super::bookkeeping::{JobStore, StoreError};

#[derive(Debug)]
struct JobRecord {
    job: Job,
    artifacts: Vec<Artifact>,
    metrics: Vec<Metric>,
}

/// Job store backed by a `HashMap` behind a tokio `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a job as-is. Lets tests start from any status.
    pub async fn insert(&self, job: Job) {
        self.records.write().await.insert(
            job.id.clone(),
            JobRecord {
                job,
                artifacts: Vec::new(),
                metrics: Vec::new(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        pipeline: PipelineKind,
        config: serde_json::Value,
        input_locator: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut job = Job::new(pipeline, config);
        job.input_locator = input_locator;
        self.insert(job.clone()).await;
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(id)
            .map(|record| record.job.clone()))
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let records = self.records.read().await;
        let mut jobs: Vec<Job> = records
            .values()
            .map(|record| &record.job)
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn transition_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<Job>, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };

        if record
            .job
            .apply_transition(status, error, Utc::now())
            .is_applied()
        {
            Ok(Some(record.job.clone()))
        } else {
            Ok(None)
        }
    }

    async fn add_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        locator: &str,
        size_bytes: u64,
    ) -> Result<Artifact, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let artifact = Artifact {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            kind,
            locator: locator.to_string(),
            size_bytes,
            created_at: Utc::now(),
        };
        record.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn add_metric(
        &self,
        job_id: &str,
        name: &str,
        value: f64,
    ) -> Result<Metric, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let metric = Metric {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            name: name.to_string(),
            value,
            created_at: Utc::now(),
        };
        record.metrics.push(metric.clone());
        Ok(metric)
    }

    async fn record_outputs(
        &self,
        job_id: &str,
        artifacts: &[ProducedArtifact],
        metrics: &[(String, f64)],
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let now = Utc::now();
        record.artifacts = artifacts
            .iter()
            .map(|produced| Artifact {
                id: Uuid::new_v4(),
                job_id: job_id.to_string(),
                kind: produced.kind,
                locator: produced.locator.clone(),
                size_bytes: produced.size_bytes,
                created_at: now,
            })
            .collect();
        record.metrics = metrics
            .iter()
            .map(|(name, value)| Metric {
                id: Uuid::new_v4(),
                job_id: job_id.to_string(),
                name: name.clone(),
                value: *value,
                created_at: now,
            })
            .collect();
        Ok(())
    }

    async fn set_input(&self, id: &str, locator: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.job.input_locator = Some(locator.to_string());
        Ok(())
    }

    async fn set_task_handle(&self, id: &str, handle: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.job.task_handle = Some(handle.to_string());
        Ok(())
    }

    async fn increment_retry(&self, id: &str) -> Result<u32, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.job.retry_count += 1;
        Ok(record.job.retry_count)
    }

    async fn list_artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(job_id)
            .map(|record| record.artifacts.clone())
            .unwrap_or_default())
    }

    async fn list_metrics(&self, job_id: &str) -> Result<Vec<Metric>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(job_id)
            .map(|record| record.metrics.clone())
            .unwrap_or_default())
    }

    async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}
