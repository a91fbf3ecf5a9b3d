//! Sequence/structure co-design stage (DiffAb).

use async_trait::async_trait;
use tracing::info;

use crate::error::StageError;
use crate::execution::AbortSignal;
use crate::pipeline::Stage;

use super::{num_designs, StageContext, StageExecutor, StageResult, StageWorkspace};

/// Runs the design model on the job input.
pub struct DesignStage {
    context: StageContext,
}

impl DesignStage {
    pub fn new(context: StageContext) -> Self {
        Self { context }
    }
}

/// `--input IN --output OUT --num_designs N`
pub fn design_command(workspace: &StageWorkspace, num_designs: u32) -> Vec<String> {
    vec![
        "--input".to_string(),
        workspace.container_input(),
        "--output".to_string(),
        workspace.container_outputs(),
        "--num_designs".to_string(),
        num_designs.to_string(),
    ]
}

#[async_trait]
impl StageExecutor for DesignStage {
    fn stage(&self) -> Stage {
        Stage::Design
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
            .prepare(Stage::Design, job_id, input_locator)
            .await?;
        let designs = num_designs(config);
        info!(job_id, designs, "Running design stage");

        let command = design_command(&workspace, designs);
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::execution::{IsolatedRunner, RunnerSettings};
    use crate::job::ArtifactKind;
    use crate::pipeline::config::PipelineConfig;
    use crate::stages::test_support::ModelBackend;
    use crate::storage::{LocalObjectStore, ObjectStore};

    struct Fixture {
        _workspace: tempfile::TempDir,
        _objects: tempfile::TempDir,
        objects: Arc<LocalObjectStore>,
        config: Arc<PipelineConfig>,
    }

    async fn fixture() -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let objects_dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LocalObjectStore::new(
            objects_dir.path(),
            "http://localhost/objects",
            "secret",
        ));
        objects
            .put("jobs/job-1/inputs/target.pdb", b"ATOM target".to_vec())
            .await
            .unwrap();
        let config = Arc::new(
            PipelineConfig::new()
                .with_workspace_root(workspace.path())
                .with_workspace_volume("shared")
                .with_weights_volumes_from(vec!["weights".to_string()]),
        );
        Fixture {
            _workspace: workspace,
            _objects: objects_dir,
            objects,
            config,
        }
    }

    fn stage(fixture: &Fixture, backend: Arc<ModelBackend>) -> DesignStage {
        let runner = Arc::new(IsolatedRunner::new(
            backend,
            RunnerSettings::default().with_gpu_enabled(true),
        ));
        DesignStage::new(StageContext::new(
            runner,
            fixture.objects.clone(),
            fixture.config.clone(),
        ))
    }

    #[tokio::test]
    async fn test_design_harvests_outputs() {
        let fixture = fixture().await;
        let outputs = fixture.config.workspace_root.join("job-1/design/outputs");
        let backend = Arc::new(ModelBackend::writing(vec![
            (outputs.join("design_0.pdb"), b"ATOM 0".to_vec()),
            (outputs.join("design_1.pdb"), b"ATOM 1".to_vec()),
        ]));
        let stage = stage(&fixture, backend.clone());

        let result = stage
            .execute(
                "job-1",
                "jobs/job-1/inputs/target.pdb",
                &serde_json::json!({"num_designs": 2}),
                &AbortSignal::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.metrics.is_none());
        assert_eq!(result.artifacts.len(), 2);
        assert_eq!(result.artifacts[0].locator, "jobs/job-1/design/design_0.pdb");
        assert_eq!(result.artifacts[0].kind, ArtifactKind::DesignStructure);

        let staged = fixture.config.workspace_root.join("job-1/design/input.pdb");
        assert_eq!(std::fs::read(staged).unwrap(), b"ATOM target");

        let spec = backend.last_spec();
        assert_eq!(spec.image, "diffab:latest");
        assert_eq!(
            spec.cmd,
            vec![
                "--input",
                "/workspace/job-1/design/input.pdb",
                "--output",
                "/workspace/job-1/design/outputs",
                "--num_designs",
                "2",
            ]
        );
        assert_eq!(spec.binds, vec!["shared:/workspace".to_string()]);
        assert_eq!(spec.volumes_from, vec!["weights".to_string()]);
        assert!(spec.gpu);
        assert_eq!(spec.labels.get("fold-forge.job").map(String::as_str), Some("job-1"));
        assert_eq!(backend.removals(), 1);
    }

    #[tokio::test]
    async fn test_design_nonzero_exit_is_unsuccessful_result() {
        let fixture = fixture().await;
        let backend = Arc::new(ModelBackend::failing(2, "invalid chain id"));
        let stage = stage(&fixture, backend);

        let result = stage
            .execute(
                "job-1",
                "jobs/job-1/inputs/target.pdb",
                &serde_json::json!({}),
                &AbortSignal::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.logs, "invalid chain id");
        assert!(result.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_design_cancelled_before_start() {
        let fixture = fixture().await;
        let backend = Arc::new(ModelBackend::default());
        let stage = stage(&fixture, backend.clone());
        let signal = AbortSignal::new();
        signal.cancel();

        let err = stage
            .execute(
                "job-1",
                "jobs/job-1/inputs/target.pdb",
                &serde_json::json!({}),
                &signal,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(backend.created.lock().unwrap().is_empty());
    }
}
