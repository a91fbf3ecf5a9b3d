//! Docker API wrapper using the bollard crate.
//!
//! [`DockerClient`] is the production [`ContainerBackend`]: it creates a
//! container from a [`ContainerSpec`], waits for it, collects its output and
//! removes it.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::RunnerError;
use crate::execution::resources::ExecutionLimits;
use crate::execution::runner::{CapturedOutput, ContainerBackend};

/// Everything needed to create one stage container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Arguments passed to the image entrypoint.
    pub cmd: Vec<String>,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Bind/volume mounts (`source:target[:ro]`).
    pub binds: Vec<String>,
    /// Containers whose volumes are mounted as well (model weights).
    pub volumes_from: Vec<String>,
    /// Attach all GPUs.
    pub gpu: bool,
    /// Resource limits for the container.
    pub limits: ExecutionLimits,
    /// Labels used to find containers belonging to a job.
    pub labels: HashMap<String, String>,
    /// Network mode (e.g., "none", "bridge").
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            binds: Vec::new(),
            volumes_from: Vec::new(),
            gpu: false,
            limits: ExecutionLimits::default(),
            labels: HashMap::new(),
            network_mode: None,
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
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

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Host configuration carrying limits, mounts and the GPU request.
    pub fn host_config(&self) -> HostConfig {
        let device_requests = self.gpu.then(|| {
            vec![DeviceRequest {
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        HostConfig {
            memory: Some(self.limits.memory_bytes()),
            cpu_period: Some(self.limits.cpu_period()),
            cpu_quota: Some(self.limits.cpu_quota()),
            pids_limit: Some(self.limits.max_processes as i64),
            shm_size: Some(self.limits.shm_bytes()),
            network_mode: self.network_mode.clone(),
            binds: non_empty(&self.binds),
            volumes_from: non_empty(&self.volumes_from),
            device_requests,
            ..Default::default()
        }
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }
}

/// Maps a bollard error, separating daemon trouble from request failures.
fn classify(context: &str, error: BollardError) -> RunnerError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RunnerError::RunFailed(format!("{context}: {message} (status {status_code})")),
        other => RunnerError::DaemonUnavailable(format!("{context}: {other}")),
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerBackend for DockerClient {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RunnerError> {
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: non_empty(&spec.cmd),
            env: non_empty(&spec.env),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            host_config: Some(spec.host_config()),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| classify("Failed to create container", e))?;

        debug!(container = %spec.name, id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RunnerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify("Failed to start container", e))
    }

    async fn wait(&self, id: &str) -> Result<i64, RunnerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify("Error waiting for container", e)),
            None => Err(RunnerError::RunFailed(
                "Container wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn logs(&self, id: &str) -> Result<CapturedOutput, RunnerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = CapturedOutput::default();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(classify("Error reading logs", e)),
            }
        }

        Ok(output)
    }

    async fn kill(&self, id: &str) -> Result<(), RunnerError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RunnerError::ContainerNotFound { id: id.to_string() }
                } else {
                    classify("Failed to kill container", e)
                }
            })
    }

    async fn remove(&self, id: &str) -> Result<(), RunnerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify("Failed to remove container", e)),
        }
    }
}
