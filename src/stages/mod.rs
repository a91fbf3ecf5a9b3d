//! Stage executors: one containerized model per pipeline stage.
//!
//! Every executor follows the same protocol:
//!
//! ```text
//!  object store ──get──▶ {workspace}/{job}/{stage}/input.pdb
//!                                 │
//!                         container (model)
//!                                 │
//!  object store ◀──put── {workspace}/{job}/{stage}/outputs/*.pdb
//! ```
//!
//! The container sees the workspace through the shared volume, so nothing is
//! copied in or out of it. Stage-specific behavior is limited to the command
//! line and, for prediction, the `metrics.json` side-file.

pub mod backbone;
pub mod design;
pub mod prediction;
pub mod workspace;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StageError;
use crate::execution::{AbortSignal, IsolatedRunner, Mount, RunOutput, RunRequest};
use crate::pipeline::config::{PipelineConfig, DEFAULT_NUM_DESIGNS};
use crate::pipeline::Stage;
use crate::storage::ObjectStore;

pub use backbone::BackboneStage;
pub use design::DesignStage;
pub use prediction::PredictionStage;
pub use workspace::StageWorkspace;

pub use crate::job::ProducedArtifact;

/// One entry of a stage's metrics side-file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Series(Vec<f64>),
    /// Anything else. Kept so one odd entry does not reject the whole file.
    Other(serde_json::Value),
}

impl MetricValue {
    /// Scalar to store: the value itself, or the mean of a series.
    ///
    /// Empty series and non-numeric values have no scalar.
    pub fn reduce(&self) -> Option<f64> {
        match self {
            MetricValue::Number(value) => Some(*value),
            MetricValue::Series(values) if values.is_empty() => None,
            MetricValue::Series(values) => Some(values.iter().sum::<f64>() / values.len() as f64),
            MetricValue::Other(_) => None,
        }
    }
}

/// Reduces a metrics map to the scalars that get stored, in name order.
pub fn reduce_metrics(metrics: &BTreeMap<String, MetricValue>) -> Vec<(String, f64)> {
    let mut reduced = Vec::with_capacity(metrics.len());
    for (name, value) in metrics {
        match value.reduce() {
            Some(scalar) => reduced.push((name.clone(), scalar)),
            None => match value {
                MetricValue::Series(_) => debug!(metric = %name, "Skipping empty metric series"),
                _ => warn!(metric = %name, value = ?value, "Skipping non-numeric metric"),
            },
        }
    }
    reduced
}

/// Outcome of one stage run.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub artifacts: Vec<ProducedArtifact>,
    pub metrics: Option<BTreeMap<String, MetricValue>>,
    /// Stdout and stderr on success, stderr alone on failure.
    pub logs: String,
    pub success: bool,
    pub exit_code: i64,
}

impl StageResult {
    /// Successful run with the given artifacts.
    pub fn succeeded(artifacts: Vec<ProducedArtifact>) -> Self {
        Self {
            artifacts,
            success: true,
            ..Default::default()
        }
    }

    /// Failed run.
    pub fn failed(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            logs: stderr.into(),
            success: false,
            exit_code,
            ..Default::default()
        }
    }

    /// Result of a finished container, before harvesting.
    pub fn from_run(output: RunOutput) -> Self {
        if output.success {
            let logs = if output.stderr.is_empty() {
                output.stdout
            } else {
                format!("{}\n{}", output.stdout, output.stderr)
            };
            Self {
                logs,
                success: true,
                exit_code: output.exit_code,
                ..Default::default()
            }
        } else {
            Self::failed(output.exit_code, output.stderr)
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ProducedArtifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_metrics(mut self, metrics: BTreeMap<String, MetricValue>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// One pipeline stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Runs the stage on `input_locator`.
    ///
    /// A model that exits non-zero is reported through
    /// `StageResult::success`, not as an error.
    async fn execute(
        &self,
        job_id: &str,
        input_locator: &str,
        config: &serde_json::Value,
        signal: &AbortSignal,
    ) -> Result<StageResult, StageError>;
}

/// Collaborators shared by the container-backed executors.
#[derive(Clone)]
pub struct StageContext {
    pub runner: Arc<IsolatedRunner>,
    pub objects: Arc<dyn ObjectStore>,
    pub config: Arc<PipelineConfig>,
}

impl StageContext {
    pub fn new(
        runner: Arc<IsolatedRunner>,
        objects: Arc<dyn ObjectStore>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            runner,
            objects,
            config,
        }
    }

    /// Prepares the stage workspace and fetches the input into it.
    pub(crate) async fn prepare(
        &self,
        stage: Stage,
        job_id: &str,
        input_locator: &str,
    ) -> Result<StageWorkspace, StageError> {
        let workspace = StageWorkspace::prepare(&self.config, job_id, stage).await?;
        workspace
            .stage_input(self.objects.as_ref(), input_locator)
            .await?;
        Ok(workspace)
    }

    /// Runs the stage container with the workspace volume mounted.
    pub(crate) async fn run(
        &self,
        workspace: &StageWorkspace,
        job_id: &str,
        command: Vec<String>,
        signal: &AbortSignal,
    ) -> Result<RunOutput, StageError> {
        let stage = workspace.stage();
        let stage_config = self.config.stage(stage);

        let request = RunRequest::new(stage_config.image.clone(), command)
            .with_mount(Mount::new(
                self.config.workspace_volume.clone(),
                self.config.container_workspace.clone(),
            ))
            .with_volumes_from(self.config.weights_volumes_from.clone())
            .with_gpu(stage_config.gpu)
            .with_timeout(stage_config.timeout)
            .with_limits(self.config.limits.clone())
            .with_label("fold-forge.job", job_id)
            .with_label("fold-forge.stage", stage.as_str())
            .with_name_hint(format!("{}-{}", job_id, stage));

        self.runner
            .run(request, signal)
            .await
            .map_err(|e| StageError::from_runner(stage, e))
    }
}

/// The executor for every stage, looked up by an exhaustive match.
#[derive(Clone)]
pub struct StageSet {
    design: Arc<dyn StageExecutor>,
    backbone: Arc<dyn StageExecutor>,
    prediction: Arc<dyn StageExecutor>,
}

impl StageSet {
    pub fn new(
        design: Arc<dyn StageExecutor>,
        backbone: Arc<dyn StageExecutor>,
        prediction: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            design,
            backbone,
            prediction,
        }
    }

    /// Container-backed executors for all stages.
    pub fn containers(context: StageContext) -> Self {
        Self::new(
            Arc::new(DesignStage::new(context.clone())),
            Arc::new(BackboneStage::new(context.clone())),
            Arc::new(PredictionStage::new(context)),
        )
    }

    pub fn get(&self, stage: Stage) -> &Arc<dyn StageExecutor> {
        match stage {
            Stage::Design => &self.design,
            Stage::Backbone => &self.backbone,
            Stage::Prediction => &self.prediction,
        }
    }
}

/// Designs per run requested by the job, or the default.
pub fn num_designs(config: &serde_json::Value) -> u32 {
    config
        .get("num_designs")
        .and_then(|value| value.as_u64())
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_NUM_DESIGNS)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Container backend that plays the part of a model.

    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::RunnerError;
    use crate::execution::{CapturedOutput, ContainerBackend, ContainerSpec};

    /// Writes `files` when the container "runs", then exits with `exit_code`.
    #[derive(Default)]
    pub struct ModelBackend {
        pub exit_code: i64,
        pub files: Vec<(PathBuf, Vec<u8>)>,
        pub stderr: String,
        pub created: Mutex<Vec<ContainerSpec>>,
        pub removals: AtomicUsize,
    }

    impl ModelBackend {
        pub fn writing(files: Vec<(PathBuf, Vec<u8>)>) -> Self {
            Self {
                files,
                ..Default::default()
            }
        }

        pub fn failing(exit_code: i64, stderr: &str) -> Self {
            Self {
                exit_code,
                stderr: stderr.to_string(),
                ..Default::default()
            }
        }

        pub fn last_spec(&self) -> ContainerSpec {
            self.created.lock().unwrap().last().cloned().unwrap()
        }

        pub fn removals(&self) -> usize {
            self.removals.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContainerBackend for ModelBackend {
        async fn create(&self, spec: &ContainerSpec) -> Result<String, RunnerError> {
            self.created.lock().unwrap().push(spec.clone());
            Ok(spec.name.clone())
        }

        async fn start(&self, _id: &str) -> Result<(), RunnerError> {
            Ok(())
        }

        async fn wait(&self, _id: &str) -> Result<i64, RunnerError> {
            for (path, bytes) in &self.files {
                std::fs::write(path, bytes).unwrap();
            }
            Ok(self.exit_code)
        }

        async fn logs(&self, _id: &str) -> Result<CapturedOutput, RunnerError> {
            Ok(CapturedOutput {
                stdout: "done".to_string(),
                stderr: self.stderr.clone(),
            })
        }

        async fn kill(&self, _id: &str) -> Result<(), RunnerError> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<(), RunnerError> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_parsing() {
        let parsed: BTreeMap<String, MetricValue> = serde_json::from_str(
            r#"{"plddt": [80.0, 90.0], "ptm": 0.7, "model": "af2", "pae": []}"#,
        )
        .unwrap();

        assert_eq!(parsed["plddt"], MetricValue::Series(vec![80.0, 90.0]));
        assert_eq!(parsed["ptm"], MetricValue::Number(0.7));
        assert!(matches!(parsed["model"], MetricValue::Other(_)));
        assert_eq!(parsed["pae"], MetricValue::Series(vec![]));
    }

    #[test]
    fn test_reduce_metrics_means_and_skips() {
        let mut metrics = BTreeMap::new();
        metrics.insert("plddt".to_string(), MetricValue::Series(vec![80.0, 90.0]));
        metrics.insert("ptm".to_string(), MetricValue::Number(0.7));
        metrics.insert("pae".to_string(), MetricValue::Series(vec![]));
        metrics.insert(
            "model".to_string(),
            MetricValue::Other(serde_json::json!("af2")),
        );

        let reduced = reduce_metrics(&metrics);
        assert_eq!(
            reduced,
            vec![("plddt".to_string(), 85.0), ("ptm".to_string(), 0.7)]
        );
    }

    #[test]
    fn test_num_designs() {
        assert_eq!(num_designs(&serde_json::json!({})), 5);
        assert_eq!(num_designs(&serde_json::json!({"num_designs": 12})), 12);
        assert_eq!(num_designs(&serde_json::json!({"num_designs": 0})), 5);
        assert_eq!(num_designs(&serde_json::json!({"num_designs": "many"})), 5);
    }

    #[test]
    fn test_stage_result_from_run() {
        let ok = StageResult::from_run(RunOutput {
            stdout: "out".to_string(),
            stderr: "warn".to_string(),
            exit_code: 0,
            success: true,
        });
        assert!(ok.success);
        assert_eq!(ok.logs, "out\nwarn");

        let failed = StageResult::from_run(RunOutput {
            stdout: "out".to_string(),
            stderr: "CUDA error".to_string(),
            exit_code: 1,
            success: false,
        });
        assert!(!failed.success);
        assert_eq!(failed.logs, "CUDA error");
        assert_eq!(failed.exit_code, 1);
    }
}
