//! Pipeline selection and orchestration.
//!
//! - **Selection**: the fixed set of stage sequences a job can request
//! - **Config**: stage images, timeouts and the shared workspace layout
//! - **Orchestrator**: runs one job through its stages and records the outcome
//!
//! # Pipeline Flow
//!
//! ```text
//! QUEUED ─▶ PROVISIONING ─▶ RUNNING ─┬─ design ─▶ backbone ─▶ prediction
//!                                    │     (first artifact feeds the next stage)
//!                                    ▼
//!                             POST_PROCESSING ─▶ persist artifacts/metrics ─▶ COMPLETED
//! ```
//!
//! Any error records FAILED once; cancellation records CANCELLED.
//!
//! # Example
//!
//! ```rust,ignore
//! use fold_forge::pipeline::PipelineOrchestrator;
//! use fold_forge::execution::AbortSignal;
//!
//! let orchestrator = PipelineOrchestrator::new(store, stages);
//! let outcome = orchestrator.run(&job_id, &AbortSignal::new()).await?;
//! ```

pub mod config;
pub mod orchestrator;
pub mod selection;

pub use config::{PipelineConfig, StageConfig, DEFAULT_NUM_DESIGNS};
pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineOutcome, PipelineStats};
pub use selection::{PipelineKind, Stage};
