//! Error types for fold-forge operations.
//!
//! Subsystem errors that cross module boundaries live here:
//! - Input validation at the submission boundary
//! - Isolated container execution
//! - Stage execution and output harvesting
//! - Object storage
//!
//! Module-local errors (`StoreError`, `QueueError`, `DispatchError`,
//! `PipelineError`, `ConfigError`, `MigrationError`, `ServiceError`) are defined next to the
//! code that raises them and re-exported from here.

use thiserror::Error;

use crate::pipeline::Stage;

pub use crate::config::ConfigError;
pub use crate::pipeline::PipelineError;
pub use crate::scheduler::{DispatchError, QueueError};
pub use crate::service::ServiceError;
pub use crate::storage::{MigrationError, StoreError};

/// Malformed caller input. Surfaced immediately; the job never runs.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unknown pipeline type '{0}'")]
    UnknownPipeline(String),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Unknown job status '{0}'")]
    UnknownStatus(String),

    #[error("Unsupported input file '{file}': expected one of {expected}")]
    UnsupportedFormat { file: String, expected: String },

    #[error("Input file '{0}' is empty")]
    EmptyInput(String),

    #[error("Input file '{file}' is {size} bytes, limit is {limit}")]
    InputTooLarge { file: String, size: u64, limit: u64 },

    #[error("Invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("Job configuration must be a JSON object")]
    InvalidConfig,

    #[error("Job {0} has no input artifact")]
    MissingInput(String),
}

/// Errors raised by the isolated container runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Container execution is disabled")]
    Disabled,

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Container run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("timeout: container execution exceeded {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Container execution was cancelled")]
    Cancelled,
}

impl RunnerError {
    /// The container daemon could not be reached; a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::DaemonUnavailable(_))
    }
}

/// Errors raised while running one pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} stage failed (exit code {exit_code}): {stderr}")]
    Failed {
        stage: Stage,
        exit_code: i64,
        stderr: String,
    },

    #[error("{stage} stage produced no artifacts")]
    NoArtifacts { stage: Stage },

    #[error("{stage} stage produced no metrics file")]
    MissingMetrics { stage: Stage },

    #[error("{stage} stage wrote an unreadable metrics file: {reason}")]
    InvalidMetrics { stage: Stage, reason: String },

    #[error("timeout: {stage} stage exceeded {seconds} seconds")]
    Timeout { stage: Stage, seconds: u64 },

    #[error("{stage} stage was cancelled")]
    Cancelled { stage: Stage },

    #[error("{stage} stage runner error: {source}")]
    Runner {
        stage: Stage,
        #[source]
        source: RunnerError,
    },

    #[error("{stage} stage storage error: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: ObjectStoreError,
    },

    #[error("{stage} stage workspace error: {source}")]
    Workspace {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    /// Wraps a runner error, lifting timeout and cancellation into stage terms.
    pub fn from_runner(stage: Stage, error: RunnerError) -> Self {
        match error {
            RunnerError::Timeout { seconds } => StageError::Timeout { stage, seconds },
            RunnerError::Cancelled => StageError::Cancelled { stage },
            source => StageError::Runner { stage, source },
        }
    }

    /// Infrastructure trouble rather than a problem with the job itself.
    pub fn is_transient(&self) -> bool {
        match self {
            StageError::Runner { source, .. } => source.is_transient(),
            StageError::Storage { source, .. } => source.is_transient(),
            StageError::Workspace { .. } => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled { .. })
    }
}

/// Errors raised by object storage.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Invalid object locator '{0}'")]
    InvalidLocator(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectStoreError::Io(_))
    }
}
