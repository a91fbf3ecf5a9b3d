//! Isolated execution of one compute step.
//!
//! [`IsolatedRunner::run`] creates an ephemeral container, waits for it under
//! a timeout and an [`AbortSignal`], captures its output and removes it. The
//! container is removed exactly once on every path: normal exit, non-zero
//! exit, backend error, timeout and abort. If the run future is dropped
//! before it finishes, a guard schedules the removal on the runtime.
//!
//! Files are exchanged through pre-arranged shared volumes only; the runner
//! never copies anything in or out of the container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RunnerError;

use super::abort::AbortSignal;
use super::docker_client::ContainerSpec;
use super::resources::ExecutionLimits;

/// Low-level container operations the runner is built on.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Creates a container and returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RunnerError>;

    async fn start(&self, id: &str) -> Result<(), RunnerError>;

    /// Blocks until the container stops and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, RunnerError>;

    async fn logs(&self, id: &str) -> Result<CapturedOutput, RunnerError>;

    /// Sends SIGKILL.
    async fn kill(&self, id: &str) -> Result<(), RunnerError>;

    /// Force-removes the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), RunnerError>;
}

/// Output streams of a finished container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A volume or host path made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Volume name or host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Docker bind syntax.
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// One container invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub volumes_from: Vec<String>,
    /// GPU wanted by the call site. Honored only when enabled globally.
    pub gpu: bool,
    pub timeout: Duration,
    pub limits: ExecutionLimits,
    pub labels: HashMap<String, String>,
    /// Readable part of the container name, e.g. `{job_id}-{stage}`.
    pub name_hint: String,
}

impl RunRequest {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
            env: Vec::new(),
            mounts: Vec::new(),
            volumes_from: Vec::new(),
            gpu: false,
            timeout: Duration::from_secs(3600),
            limits: ExecutionLimits::default(),
            labels: HashMap::new(),
            name_hint: "run".to_string(),
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_volumes_from(mut self, containers: Vec<String>) -> Self {
        self.volumes_from = containers;
        self
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timeout_secs(self, seconds: u64) -> Self {
        self.with_timeout(Duration::from_secs(seconds))
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_name_hint(mut self, hint: impl Into<String>) -> Self {
        self.name_hint = hint.into();
        self
    }
}

/// Result of a container that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// `exit_code == 0`
    pub success: bool,
}

impl RunOutput {
    pub fn new(output: CapturedOutput, exit_code: i64) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
            success: exit_code == 0,
        }
    }
}

/// Process-wide runner switches.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// When false every run fails with `RunnerError::Disabled`.
    pub enabled: bool,
    /// Global GPU capability. Call sites cannot override a `false` here.
    pub gpu_enabled: bool,
    /// Prefix of every container name.
    pub name_prefix: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gpu_enabled: false,
            name_prefix: "fold-forge".to_string(),
        }
    }
}

impl RunnerSettings {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_gpu_enabled(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }
}

/// Runs compute steps as ephemeral containers.
pub struct IsolatedRunner {
    backend: Arc<dyn ContainerBackend>,
    settings: RunnerSettings,
}

impl IsolatedRunner {
    pub fn new(backend: Arc<dyn ContainerBackend>, settings: RunnerSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Runs one container to completion.
    ///
    /// # Errors
    ///
    /// - `RunnerError::Timeout` when `request.timeout` elapses; the container
    ///   is killed first.
    /// - `RunnerError::Cancelled` (or `Timeout`, depending on the abort
    ///   reason) when `signal` fires; the container is killed first.
    /// - Backend errors from create/start/wait/logs.
    ///
    /// A non-zero exit is not an error: it is reported through
    /// `RunOutput::success`.
    pub async fn run(
        &self,
        request: RunRequest,
        signal: &AbortSignal,
    ) -> Result<RunOutput, RunnerError> {
        if !self.settings.enabled {
            return Err(RunnerError::Disabled);
        }
        if signal.is_aborted() {
            return Err(signal.runner_error());
        }

        let gpu = request.gpu && self.settings.gpu_enabled;
        if request.gpu && !gpu {
            debug!(image = %request.image, "GPU requested but disabled, running without GPU");
        }

        let spec = self.container_spec(&request, gpu);
        info!(
            container = %spec.name,
            image = %spec.image,
            gpu,
            timeout_secs = request.timeout.as_secs(),
            "Starting container"
        );

        let container_id = self.backend.create(&spec).await?;
        let guard = RemovalGuard::new(Arc::clone(&self.backend), container_id.clone());

        let result = self.supervise(&container_id, &request, signal).await;

        guard.remove().await;

        match &result {
            Ok(output) => info!(
                container = %spec.name,
                exit_code = output.exit_code,
                "Container finished"
            ),
            Err(e) => warn!(container = %spec.name, error = %e, "Container run failed"),
        }

        result
    }

    async fn supervise(
        &self,
        container_id: &str,
        request: &RunRequest,
        signal: &AbortSignal,
    ) -> Result<RunOutput, RunnerError> {
        self.backend.start(container_id).await?;

        let exit_code = tokio::select! {
            exit = self.backend.wait(container_id) => exit?,
            _ = tokio::time::sleep(request.timeout) => {
                warn!(
                    container_id,
                    timeout_secs = request.timeout.as_secs(),
                    "Container exceeded its timeout, killing"
                );
                self.force_kill(container_id).await;
                return Err(RunnerError::Timeout {
                    seconds: request.timeout.as_secs(),
                });
            }
            _ = signal.aborted() => {
                info!(container_id, reason = ?signal.reason(), "Run aborted, killing container");
                self.force_kill(container_id).await;
                return Err(signal.runner_error());
            }
        };

        let output = self.backend.logs(container_id).await?;
        Ok(RunOutput::new(output, exit_code))
    }

    async fn force_kill(&self, container_id: &str) {
        if let Err(e) = self.backend.kill(container_id).await {
            // The container may have exited on its own in the meantime.
            warn!(container_id, error = %e, "Failed to kill container");
        }
    }

    fn container_spec(&self, request: &RunRequest, gpu: bool) -> ContainerSpec {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}",
            self.settings.name_prefix,
            request.name_hint,
            &suffix[..8]
        );

        ContainerSpec::new(name, request.image.clone())
            .with_cmd(request.command.clone())
            .with_env(request.env.clone())
            .with_binds(request.mounts.iter().map(Mount::to_bind).collect())
            .with_volumes_from(request.volumes_from.clone())
            .with_gpu(gpu)
            .with_limits(request.limits.clone())
            .with_labels(request.labels.clone())
    }
}

/// Removes a container exactly once, even if the owning future is dropped.
struct RemovalGuard {
    backend: Option<Arc<dyn ContainerBackend>>,
    container_id: String,
}

impl RemovalGuard {
    fn new(backend: Arc<dyn ContainerBackend>, container_id: String) -> Self {
        Self {
            backend: Some(backend),
            container_id,
        }
    }

    async fn remove(mut self) {
        if let Some(backend) = self.backend.take() {
            if let Err(e) = backend.remove(&self.container_id).await {
                warn!(container_id = %self.container_id, error = %e, "Failed to remove container");
            }
        }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let container_id = std::mem::take(&mut self.container_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.remove(&container_id).await {
                        warn!(container_id = %container_id, error = %e, "Failed to remove abandoned container");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %container_id, "No runtime left to remove abandoned container");
            }
        }
    }
}
