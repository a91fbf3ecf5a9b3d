//! Structure prediction stage (AlphaFold2).
//!
//! Besides the predicted structures the model writes `outputs/metrics.json`,
//! an object mapping metric names to a number or an array of numbers. A run
//! without that file is not a successful prediction.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::error::StageError;
use crate::execution::AbortSignal;
use crate::pipeline::Stage;

use super::{MetricValue, StageContext, StageExecutor, StageResult, StageWorkspace};

/// Metrics side-file written next to the predicted structures.
pub const METRICS_FILE: &str = "metrics.json";

pub struct PredictionStage {
    context: StageContext,
}

impl PredictionStage {
    pub fn new(context: StageContext) -> Self {
        Self { context }
    }
}

/// `--input IN --output_dir OUT`
pub fn prediction_command(workspace: &StageWorkspace) -> Vec<String> {
    vec![
        "--input".to_string(),
        workspace.container_input(),
        "--output_dir".to_string(),
        workspace.container_outputs(),
    ]
}

/// Reads and parses a metrics side-file.
pub async fn read_metrics(path: &Path) -> Result<BTreeMap<String, MetricValue>, StageError> {
    let stage = Stage::Prediction;
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StageError::MissingMetrics { stage })
        }
        Err(source) => return Err(StageError::Workspace { stage, source }),
    };

    serde_json::from_slice(&raw).map_err(|e| StageError::InvalidMetrics {
        stage,
        reason: e.to_string(),
    })
}

#[async_trait]
impl StageExecutor for PredictionStage {
    fn stage(&self) -> Stage {
        Stage::Prediction
    }

    async fn execute(
        &self,
        job_id: &str,
        input_locator: &str,
        _config: &serde_json::Value,
        signal: &AbortSignal,
    ) -> Result<StageResult, StageError> {
        let workspace = self
            .context
            .prepare(Stage::Prediction, job_id, input_locator)
            .await?;
        info!(job_id, input = input_locator, "Running prediction stage");

        let command = prediction_command(&workspace);
        let output = self.context.run(&workspace, job_id, command, signal).await?;

        let result = StageResult::from_run(output);
        if !result.success {
            return Ok(result);
        }

        let metrics = read_metrics(&workspace.host_outputs().join(METRICS_FILE)).await?;
        let artifacts = workspace
            .harvest_structures(self.context.objects.as_ref(), job_id)
            .await?;

        Ok(result.with_artifacts(artifacts).with_metrics(metrics))
    }
}
