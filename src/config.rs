//! Process-wide settings read from the environment.
//!
//! Every value has a default; `Settings::from_env` only overrides what is
//! set. The `*_config` helpers turn settings into the per-component
//! configurations used by the orchestrator, runner, workers and dispatcher.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::execution::{ExecutionLimits, RunnerSettings};
use crate::pipeline::{PipelineConfig, Stage, StageConfig};
use crate::scheduler::{DispatcherConfig, WorkerPoolConfig};
use crate::storage::{LocalObjectStore, DEFAULT_URL_TTL};

/// Errors that can occur while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings for one fold-forge process.
#[derive(Debug, Clone)]
pub struct Settings {
    // Bookkeeping and queue
    pub database_url: String,
    pub redis_url: String,
    pub queue_name: String,

    // Object storage
    pub storage_path: PathBuf,
    pub storage_base_url: String,
    pub presign_secret: String,
    pub presign_ttl: Duration,
    /// Largest accepted input upload.
    pub max_input_bytes: u64,

    // Execution
    pub docker_enabled: bool,
    pub gpu_enabled: bool,
    pub pipeline: PipelineConfig,

    // Workers
    pub num_workers: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub soft_timeout_margin: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub cancel_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fold_forge".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "fold_forge_jobs".to_string(),

            storage_path: PathBuf::from("./object-store"),
            storage_base_url: "http://localhost:8000/objects".to_string(),
            presign_secret: "fold-forge-dev-secret".to_string(),
            presign_ttl: DEFAULT_URL_TTL,
            max_input_bytes: 100 * 1024 * 1024,

            docker_enabled: true,
            gpu_enabled: false,
            pipeline: PipelineConfig::default(),

            num_workers: 1,
            poll_interval: Duration::from_millis(1000),
            job_timeout: Duration::from_secs(10_800), // 3 hours
            soft_timeout_margin: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_secs(60),
            max_retry_backoff: Duration::from_secs(900),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`, `REDIS_URL`, `QUEUE_NAME`
    /// - `STORAGE_PATH`, `STORAGE_BASE_URL`, `PRESIGN_SECRET`, `PRESIGN_TTL_SECONDS`
    /// - `MAX_INPUT_BYTES`
    /// - `DOCKER_ENABLED`, `GPU_ENABLED`
    /// - `WORKSPACE_ROOT`, `WORKSPACE_VOLUME`, `CONTAINER_WORKSPACE`,
    ///   `WEIGHTS_VOLUMES_FROM` (comma-separated container names)
    /// - `CONTAINER_MEMORY_MB`, `CONTAINER_CPU_CORES`
    /// - `{DESIGN,BACKBONE,PREDICTION}_IMAGE`, `{DESIGN,BACKBONE,PREDICTION}_TIMEOUT_SECONDS`
    /// - `NUM_WORKERS`, `POLL_INTERVAL_MS`, `JOB_TIMEOUT_SECONDS`,
    ///   `SOFT_TIMEOUT_MARGIN_SECONDS`
    /// - `MAX_RETRIES`, `RETRY_BACKOFF_SECONDS`, `MAX_RETRY_BACKOFF_SECONDS`,
    ///   `CANCEL_GRACE_SECONDS`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting settings do not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let env = EnvReader { lookup };

        if let Some(val) = env.string("DATABASE_URL") {
            settings.database_url = val;
        }
        if let Some(val) = env.string("REDIS_URL") {
            settings.redis_url = val;
        }
        if let Some(val) = env.string("QUEUE_NAME") {
            settings.queue_name = val;
        }

        if let Some(val) = env.string("STORAGE_PATH") {
            settings.storage_path = PathBuf::from(val);
        }
        if let Some(val) = env.string("STORAGE_BASE_URL") {
            settings.storage_base_url = val;
        }
        if let Some(val) = env.string("PRESIGN_SECRET") {
            settings.presign_secret = val;
        }
        if let Some(secs) = env.parsed::<u64>("PRESIGN_TTL_SECONDS")? {
            settings.presign_ttl = Duration::from_secs(secs);
        }
        if let Some(val) = env.parsed("MAX_INPUT_BYTES")? {
            settings.max_input_bytes = val;
        }

        if let Some(val) = env.boolean("DOCKER_ENABLED")? {
            settings.docker_enabled = val;
        }
        if let Some(val) = env.boolean("GPU_ENABLED")? {
            settings.gpu_enabled = val;
        }

        // Workspace and containers
        let pipeline = &mut settings.pipeline;
        if let Some(val) = env.string("WORKSPACE_ROOT") {
            pipeline.workspace_root = PathBuf::from(val);
        }
        if let Some(val) = env.string("WORKSPACE_VOLUME") {
            pipeline.workspace_volume = val;
        }
        if let Some(val) = env.string("CONTAINER_WORKSPACE") {
            pipeline.container_workspace = val;
        }
        if let Some(val) = env.string("WEIGHTS_VOLUMES_FROM") {
            pipeline.weights_volumes_from = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(val) = env.parsed("CONTAINER_MEMORY_MB")? {
            pipeline.limits.memory_mb = val;
        }
        if let Some(val) = env.parsed("CONTAINER_CPU_CORES")? {
            pipeline.limits.cpu_cores = val;
        }
        for stage in Stage::ALL {
            let prefix = stage.as_str().to_uppercase();
            let config = pipeline.stage_mut(stage);
            if let Some(image) = env.string(&format!("{}_IMAGE", prefix)) {
                config.image = image;
            }
            if let Some(secs) = env.parsed::<u64>(&format!("{}_TIMEOUT_SECONDS", prefix))? {
                config.timeout = Duration::from_secs(secs);
            }
        }

        // Workers
        if let Some(val) = env.parsed("NUM_WORKERS")? {
            settings.num_workers = val;
        }
        if let Some(ms) = env.parsed::<u64>("POLL_INTERVAL_MS")? {
            settings.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parsed::<u64>("JOB_TIMEOUT_SECONDS")? {
            settings.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<u64>("SOFT_TIMEOUT_MARGIN_SECONDS")? {
            settings.soft_timeout_margin = Duration::from_secs(secs);
        }
        if let Some(val) = env.parsed("MAX_RETRIES")? {
            settings.max_retries = val;
        }
        if let Some(secs) = env.parsed::<u64>("RETRY_BACKOFF_SECONDS")? {
            settings.retry_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<u64>("MAX_RETRY_BACKOFF_SECONDS")? {
            settings.max_retry_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<u64>("CANCEL_GRACE_SECONDS")? {
            settings.cancel_grace = Duration::from_secs(secs);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.presign_secret.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "presign_secret cannot be empty".to_string(),
            ));
        }

        if self.max_input_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_input_bytes must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.soft_timeout_margin >= self.job_timeout {
            return Err(ConfigError::ValidationFailed(
                "soft_timeout_margin must be smaller than job_timeout".to_string(),
            ));
        }

        if self.retry_backoff > self.max_retry_backoff {
            return Err(ConfigError::ValidationFailed(
                "retry_backoff cannot exceed max_retry_backoff".to_string(),
            ));
        }

        if self.pipeline.limits.memory_mb < 256 {
            return Err(ConfigError::ValidationFailed(
                "container memory must be at least 256 MB".to_string(),
            ));
        }

        if self.pipeline.limits.cpu_cores <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "container cpu cores must be greater than 0".to_string(),
            ));
        }

        self.pipeline.validate()
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_presign_secret(mut self, secret: impl Into<String>) -> Self {
        self.presign_secret = secret.into();
        self
    }

    pub fn with_max_input_bytes(mut self, bytes: u64) -> Self {
        self.max_input_bytes = bytes;
        self
    }

    pub fn with_docker_enabled(mut self, enabled: bool) -> Self {
        self.docker_enabled = enabled;
        self
    }

    pub fn with_gpu_enabled(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_stage(mut self, stage: Stage, config: StageConfig) -> Self {
        *self.pipeline.stage_mut(stage) = config;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.pipeline.limits = limits;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_soft_timeout_margin(mut self, margin: Duration) -> Self {
        self.soft_timeout_margin = margin;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings::default()
            .with_enabled(self.docker_enabled)
            .with_gpu_enabled(self.gpu_enabled)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers)
            .with_poll_interval(self.poll_interval)
            .with_job_timeout(self.job_timeout)
            .with_soft_timeout_margin(self.soft_timeout_margin)
            .with_max_retries(self.max_retries)
            .with_retry_backoff(self.retry_backoff, self.max_retry_backoff)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: self.max_retries + 1,
            cancel_grace: self.cancel_grace,
            cancel_poll_interval: self.poll_interval.min(Duration::from_millis(500)),
        }
    }

    pub fn object_store(&self) -> LocalObjectStore {
        LocalObjectStore::new(
            self.storage_path.clone(),
            self.storage_base_url.clone(),
            self.presign_secret.clone(),
        )
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank values only.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.string(key)
            .map(|value| parse_env_value(value.trim(), key))
            .transpose()
    }

    fn boolean(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.string(key)
            .map(|value| parse_env_bool(value.trim(), key))
            .transpose()
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
