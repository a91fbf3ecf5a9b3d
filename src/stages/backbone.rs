//! Backbone generation stage (RFdiffusion).

use async_trait::async_trait;
use tracing::info;

use crate::error::StageError;
use crate::execution::AbortSignal;
use crate::pipeline::Stage;

use super::{num_designs, StageContext, StageExecutor, StageResult, StageWorkspace};

pub struct BackboneStage {
    context: StageContext,
}

impl BackboneStage {
    pub fn new(context: StageContext) -> Self {
        Self { context }
    }
}

/// Hydra-style overrides for the binder-design inference entrypoint.
pub fn backbone_command(workspace: &StageWorkspace, num_designs: u32) -> Vec<String> {
    vec![
        "inference.design_ppi".to_string(),
        format!("inference.input_pdb={}", workspace.container_input()),
        format!("inference.output_prefix={}/design", workspace.container_outputs()),
        format!("inference.num_designs={}", num_designs),
    ]
}

#[async_trait]
impl StageExecutor for BackboneStage {
    fn stage(&self) -> Stage {
        Stage::Backbone
    }

    async fn execute(
        &self,
        job_id: &str,
        input_locator: &str,
        config: &serde_json::Value,
        signal: &AbortSignal,
    ) -> Result<StageResult, StageError> {
        let workspace = self
            .context
            .prepare(Stage::Backbone, job_id, input_locator)
            .await?;
        let designs = num_designs(config);
        info!(job_id, designs, "Running backbone stage");

        let command = backbone_command(&workspace, designs);
        let output = self.context.run(&workspace, job_id, command, signal).await?;

        let result = StageResult::from_run(output);
        if !result.success {
            return Ok(result);
        }

        let artifacts = workspace
            .harvest_structures(self.context.objects.as_ref(), job_id)
            .await?;
        Ok(result.with_artifacts(artifacts))
    }
}
