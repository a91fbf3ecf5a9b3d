//! Stage and workspace configuration for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;
use crate::execution::ExecutionLimits;

use super::selection::Stage;

/// Number of designs generated when the job does not say otherwise.
pub const DEFAULT_NUM_DESIGNS: u32 = 5;

/// Container settings for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// Container image of the model.
    pub image: String,
    /// Per-stage wall-clock limit enforced by the runner.
    pub timeout: Duration,
    /// Whether the stage asks for GPU access.
    pub gpu: bool,
}

impl StageConfig {
    pub fn new(image: impl Into<String>, timeout: Duration) -> Self {
        Self {
            image: image.into(),
            timeout,
            gpu: true,
        }
    }

    /// Defaults for each stage.
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::Design => Self::new("diffab:latest", Duration::from_secs(1800)),
            Stage::Backbone => Self::new("rfdiffusion:latest", Duration::from_secs(3600)),
            Stage::Prediction => Self::new("af2-gamma:latest", Duration::from_secs(7200)),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }
}

/// Where stages exchange files and which containers they run.
///
/// The host sees the shared workspace at `workspace_root`; containers see
/// the same volume (`workspace_volume`) mounted at `container_workspace`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Host-side path of the shared workspace.
    pub workspace_root: PathBuf,
    /// Volume name (or host path) mounted into every stage container.
    pub workspace_volume: String,
    /// Mount point of the workspace inside containers.
    pub container_workspace: String,
    /// Containers whose volumes (model weights) every stage inherits.
    pub weights_volumes_from: Vec<String>,
    /// Resource limits applied to every stage container.
    pub limits: ExecutionLimits,
    pub design: StageConfig,
    pub backbone: StageConfig,
    pub prediction: StageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace_share"),
            workspace_volume: "fold_forge_workspace".to_string(),
            container_workspace: "/workspace".to_string(),
            weights_volumes_from: Vec::new(),
            limits: ExecutionLimits::default(),
            design: StageConfig::default_for(Stage::Design),
            backbone: StageConfig::default_for(Stage::Backbone),
            prediction: StageConfig::default_for(Stage::Prediction),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Design => &self.design,
            Stage::Backbone => &self.backbone,
            Stage::Prediction => &self.prediction,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageConfig {
        match stage {
            Stage::Design => &mut self.design,
            Stage::Backbone => &mut self.backbone,
            Stage::Prediction => &mut self.prediction,
        }
    }

    pub fn with_workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_root = path.into();
        self
    }

    pub fn with_workspace_volume(mut self, volume: impl Into<String>) -> Self {
        self.workspace_volume = volume.into();
        self
    }

    pub fn with_container_workspace(mut self, path: impl Into<String>) -> Self {
        self.container_workspace = path.into();
        self
    }

    pub fn with_weights_volumes_from(mut self, containers: Vec<String>) -> Self {
        self.weights_volumes_from = containers;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_stage(mut self, stage: Stage, config: StageConfig) -> Self {
        *self.stage_mut(stage) = config;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` on an empty image, a zero
    /// timeout, or a relative container mount point.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in Stage::ALL {
            let config = self.stage(stage);
            if config.image.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} stage image must not be empty",
                    stage
                )));
            }
            if config.timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} stage timeout must be greater than 0",
                    stage
                )));
            }
        }

        if !self.container_workspace.starts_with('/') {
            return Err(ConfigError::ValidationFailed(
                "container_workspace must be an absolute path".to_string(),
            ));
        }

        if self.workspace_volume.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "workspace_volume must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.design.image, "diffab:latest");
        assert_eq!(config.backbone.timeout, Duration::from_secs(3600));
        assert_eq!(config.prediction.image, "af2-gamma:latest");
        assert_eq!(config.prediction.timeout, Duration::from_secs(7200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_stage_overrides_one_stage() {
        let config = PipelineConfig::new().with_stage(
            Stage::Backbone,
            StageConfig::default_for(Stage::Backbone).with_image("rfdiffusion:1.1"),
        );
        assert_eq!(config.backbone.image, "rfdiffusion:1.1");
        assert_eq!(config.design.image, "diffab:latest");
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let config = PipelineConfig::new().with_stage(
            Stage::Design,
            StageConfig::default_for(Stage::Design).with_image(" "),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("design"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = PipelineConfig::new().with_stage(
            Stage::Prediction,
            StageConfig::default_for(Stage::Prediction).with_timeout(Duration::ZERO),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_mount_point() {
        let config = PipelineConfig::new().with_container_workspace("workspace");
        assert!(config.validate().is_err());
    }
}
