//! fold-forge: structural-biology job orchestration.
//!
//! Jobs carry a structure file through one or more model stages (sequence
//! design, backbone generation, structure prediction). Each stage runs in an
//! isolated container; every job moves through a strict lifecycle recorded
//! in the bookkeeping store, and work is distributed to workers through a
//! task queue.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod stages;
pub mod storage;

pub use config::Settings;
pub use error::{
    ConfigError, DispatchError, ObjectStoreError, PipelineError, QueueError, RunnerError,
    ServiceError, StageError, StoreError, ValidationError,
};
pub use job::{Job, JobStatus};
pub use service::JobService;
