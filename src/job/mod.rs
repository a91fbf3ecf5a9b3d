//! Job records and the lifecycle state machine.
//!
//! Every status change goes through [`Job::apply_transition`], which enforces
//! the legal edges of [`JobStatus`]. An illegal edge is logged and dropped
//! rather than returned as an error: stale or duplicate updates from an
//! asynchronous worker must not corrupt a job.
//!
//! ```text
//! CREATED ─► UPLOADED ─► QUEUED ─► PROVISIONING ─► RUNNING ─► POST_PROCESSING ─► COMPLETED
//!    │           │         ▲ │          │             │              │
//!    └───────────┴─────────┼─┴──────────┴─────────────┴──────────────┴─► FAILED
//!                          └──────────────────── retry ─────────────────────┘
//! CANCELLED is reachable from every state before POST_PROCESSING.
//! ```

pub mod model;
pub mod status;

pub use model::{Artifact, ArtifactKind, Job, JobFilter, Metric, ProducedArtifact, Transition};
pub use status::JobStatus;
