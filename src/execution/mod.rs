//! Isolated execution layer for pipeline stages.
//!
//! This module runs each compute step as an ephemeral Docker container using
//! the bollard crate, with resource limits, shared-volume I/O, an optional
//! GPU request and unconditional teardown.
//!
//! # Architecture
//!
//! ```text
//! Stage executor ──► IsolatedRunner::run(request, signal)
//!                        │
//!                        ├─ create ─► start ─► wait ──────► logs ─┐
//!                        │              timeout / abort ─► kill ──┤
//!                        │                                        ▼
//!                        └──────────────────────────────────► remove (once)
//! ```
//!
//! The runner talks to Docker through the [`ContainerBackend`] trait;
//! [`DockerClient`] is the bollard implementation.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fold_forge::execution::{
//!     AbortSignal, DockerClient, IsolatedRunner, Mount, RunRequest, RunnerSettings,
//! };
//!
//! let runner = IsolatedRunner::new(Arc::new(DockerClient::new()?), RunnerSettings::default());
//! let request = RunRequest::new("af2-gamma:latest", vec!["--input".into(), "/workspace/x.pdb".into()])
//!     .with_mount(Mount::new("fold_forge_workspace", "/workspace"))
//!     .with_gpu(true)
//!     .with_timeout_secs(7200);
//! let output = runner.run(request, &AbortSignal::new()).await?;
//! ```

pub mod abort;
pub mod docker_client;
pub mod resources;
pub mod runner;

pub use abort::{AbortReason, AbortSignal};
pub use docker_client::{ContainerSpec, DockerClient};
pub use resources::ExecutionLimits;
pub use runner::{
    CapturedOutput, ContainerBackend, IsolatedRunner, Mount, RunOutput, RunRequest,
    RunnerSettings,
};
