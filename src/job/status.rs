//! Job lifecycle states and the legal edges between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job record exists, no input yet.
    Created,
    /// Input artifact stored.
    Uploaded,
    /// Handed to the dispatcher, waiting for a worker.
    Queued,
    /// A worker picked the job up and is preparing the workspace.
    Provisioning,
    /// Stages are executing.
    Running,
    /// All stages succeeded, results are being recorded.
    PostProcessing,
    /// Results are available.
    Completed,
    /// The run failed. Can be re-queued.
    Failed,
    /// The job was cancelled.
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Created,
        JobStatus::Uploaded,
        JobStatus::Queued,
        JobStatus::Provisioning,
        JobStatus::Running,
        JobStatus::PostProcessing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Statuses reachable from this one in a single step.
    pub fn allowed_targets(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Created => &[Uploaded, Failed, Cancelled],
            Uploaded => &[Queued, Failed, Cancelled],
            Queued => &[Provisioning, Failed, Cancelled],
            Provisioning => &[Running, Failed, Cancelled],
            Running => &[PostProcessing, Failed, Cancelled],
            PostProcessing => &[Completed, Failed],
            Completed => &[],
            Failed => &[Queued],
            Cancelled => &[],
        }
    }

    /// Returns whether `target` is a legal next status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Completed and cancelled jobs accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Statuses that carry a `finished_at` timestamp.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses during which a worker owns the job.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobStatus::Provisioning | JobStatus::Running | JobStatus::PostProcessing
        )
    }

    /// Stable string form used in storage and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Queued => "queued",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Running => "running",
            JobStatus::PostProcessing => "post_processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_string()))
    }
}
