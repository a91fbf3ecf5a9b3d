//! Job, artifact and metric records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::pipeline::{PipelineKind, Stage};

use super::status::JobStatus;

/// Outcome of a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job moved from `from` to `to`.
    Applied { from: JobStatus, to: JobStatus },
    /// The edge is not legal; the job was left untouched.
    Rejected { from: JobStatus, to: JobStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// A unit of work tracked from upload to a final status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier (UUID v4 text).
    pub id: String,
    pub status: JobStatus,
    pub pipeline: PipelineKind,
    /// Parameters produced upstream. Never modified by the orchestration core.
    pub config: serde_json::Value,
    /// Object-storage locator of the primary input.
    pub input_locator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Identifier of the dispatched task, once dispatched.
    pub task_handle: Option<String>,
}

impl Job {
    /// Creates a job in the `Created` state with a fresh identifier.
    pub fn new(pipeline: PipelineKind, config: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Created,
            pipeline,
            config,
            input_locator: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
            retry_count: 0,
            task_handle: None,
        }
    }

    /// Sets the input locator.
    pub fn with_input(mut self, locator: impl Into<String>) -> Self {
        self.input_locator = Some(locator.into());
        self
    }

    /// Applies a status change if the state machine allows it.
    ///
    /// Illegal edges are logged and leave the job unchanged. Entering
    /// `Running` for the first time stamps `started_at`; entering a finished
    /// status stamps `finished_at` and records `error`. Re-queueing a failed
    /// job clears both so the record describes the new attempt.
    pub fn apply_transition(
        &mut self,
        target: JobStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = self.status;
        if !from.can_transition_to(target) {
            warn!(
                job_id = %self.id,
                from = %from,
                to = %target,
                "Ignoring invalid job status transition"
            );
            return Transition::Rejected { from, to: target };
        }

        self.status = target;

        if target == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }

        if target.is_finished() {
            self.finished_at = Some(now);
            if let Some(message) = error {
                self.error_message = Some(message.to_string());
            }
        }

        if from == JobStatus::Failed && target == JobStatus::Queued {
            self.finished_at = None;
            self.error_message = None;
        }

        Transition::Applied { from, to: target }
    }

    /// Stages to run for this job, in order.
    pub fn stages(&self) -> Vec<Stage> {
        self.pipeline.stages()
    }

    /// Reads an integer override from the job configuration.
    pub fn config_u32(&self, key: &str) -> Option<u32> {
        self.config
            .get(key)
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok())
    }
}

/// Kind of file a stage produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    DesignStructure,
    BackboneStructure,
    PredictedStructure,
    Log,
    Trajectory,
}

impl ArtifactKind {
    /// Structure kind emitted by a stage.
    pub fn structure_for(stage: Stage) -> Self {
        match stage {
            Stage::Design => ArtifactKind::DesignStructure,
            Stage::Backbone => ArtifactKind::BackboneStructure,
            Stage::Prediction => ArtifactKind::PredictedStructure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::DesignStructure => "design_structure",
            ArtifactKind::BackboneStructure => "backbone_structure",
            ArtifactKind::PredictedStructure => "predicted_structure",
            ArtifactKind::Log => "log",
            ArtifactKind::Trajectory => "trajectory",
        }
    }

    /// Parses the stored string form.
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "design_structure" => Some(ArtifactKind::DesignStructure),
            "backbone_structure" => Some(ArtifactKind::BackboneStructure),
            "predicted_structure" => Some(ArtifactKind::PredictedStructure),
            "log" => Some(ArtifactKind::Log),
            "trajectory" => Some(ArtifactKind::Trajectory),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: String,
    pub kind: ArtifactKind,
    pub locator: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// An output file uploaded by a stage, not yet recorded against its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub kind: ArtifactKind,
    pub locator: String,
    pub size_bytes: u64,
}

/// A persisted scalar measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub job_id: String,
    pub name: String,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Only jobs with this pipeline name (see `PipelineKind::name`).
    pub pipeline: Option<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Returns whether `job` passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self
                .pipeline
                .as_deref()
                .map_or(true, |name| job.pipeline.name() == name)
    }
}
