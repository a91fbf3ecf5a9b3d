//! Per-job, per-stage directories on the shared workspace volume.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::StageError;
use crate::job::ArtifactKind;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::Stage;
use crate::storage::{stage_output_locator, ObjectStore};

use super::ProducedArtifact;

const INPUT_FILE: &str = "input.pdb";
const OUTPUT_DIR: &str = "outputs";

/// `{root}/{job_id}/{stage}/` seen from the host and from the container.
#[derive(Debug, Clone)]
pub struct StageWorkspace {
    stage: Stage,
    host_dir: PathBuf,
    container_dir: String,
}

impl StageWorkspace {
    /// Paths for `job_id`/`stage`, without touching the filesystem.
    pub fn locate(config: &PipelineConfig, job_id: &str, stage: Stage) -> Result<Self, StageError> {
        if job_id.is_empty()
            || job_id.contains(['/', '\\'])
            || job_id == "."
            || job_id == ".."
        {
            return Err(StageError::Workspace {
                stage,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("job id '{}' is not a valid directory name", job_id),
                ),
            });
        }

        Ok(Self {
            stage,
            host_dir: config.workspace_root.join(job_id).join(stage.as_str()),
            container_dir: format!(
                "{}/{}/{}",
                config.container_workspace.trim_end_matches('/'),
                job_id,
                stage
            ),
        })
    }

    /// Creates an empty stage directory with an `outputs/` subdirectory.
    ///
    /// Leftovers of an earlier attempt are removed first.
    pub async fn prepare(
        config: &PipelineConfig,
        job_id: &str,
        stage: Stage,
    ) -> Result<Self, StageError> {
        let workspace = Self::locate(config, job_id, stage)?;

        match tokio::fs::remove_dir_all(&workspace.host_dir).await {
            Ok(()) => debug!(dir = %workspace.host_dir.display(), "Cleared previous stage workspace"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(workspace.io_error(e)),
        }

        tokio::fs::create_dir_all(workspace.host_outputs())
            .await
            .map_err(|e| workspace.io_error(e))?;

        Ok(workspace)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    pub fn host_input(&self) -> PathBuf {
        self.host_dir.join(INPUT_FILE)
    }

    pub fn host_outputs(&self) -> PathBuf {
        self.host_dir.join(OUTPUT_DIR)
    }

    pub fn container_input(&self) -> String {
        format!("{}/{}", self.container_dir, INPUT_FILE)
    }

    pub fn container_outputs(&self) -> String {
        format!("{}/{}", self.container_dir, OUTPUT_DIR)
    }

    /// Copies the object at `locator` to `input.pdb`. Returns its size.
    pub async fn stage_input(
        &self,
        objects: &dyn ObjectStore,
        locator: &str,
    ) -> Result<u64, StageError> {
        let bytes = objects
            .get(locator)
            .await
            .map_err(|source| StageError::Storage {
                stage: self.stage,
                source,
            })?;
        let size = bytes.len() as u64;

        tokio::fs::write(self.host_input(), bytes)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(stage = %self.stage, locator, size, "Staged stage input");
        Ok(size)
    }

    /// `*.pdb` files directly under `outputs/`, sorted by file name.
    pub fn structure_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(self.host_outputs())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdb"))
            })
            .collect();

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        files
    }

    /// Uploads every structure file and reports it with the stage's kind.
    ///
    /// All or nothing: if one upload fails, the files already uploaded by
    /// this call are deleted again.
    pub async fn harvest_structures(
        &self,
        objects: &dyn ObjectStore,
        job_id: &str,
    ) -> Result<Vec<ProducedArtifact>, StageError> {
        let kind = ArtifactKind::structure_for(self.stage);
        let mut artifacts = Vec::new();

        for path in self.structure_files() {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            match self.upload(objects, job_id, &path, file_name).await {
                Ok((locator, size_bytes)) => artifacts.push(ProducedArtifact {
                    kind,
                    locator,
                    size_bytes,
                }),
                Err(e) => {
                    for artifact in &artifacts {
                        if let Err(err) = objects.delete(&artifact.locator).await {
                            warn!(job_id, locator = %artifact.locator, error = %err, "Failed to remove partial stage output");
                        }
                    }
                    return Err(e);
                }
            }
        }

        debug!(stage = %self.stage, job_id, count = artifacts.len(), "Harvested stage outputs");
        Ok(artifacts)
    }

    async fn upload(
        &self,
        objects: &dyn ObjectStore,
        job_id: &str,
        path: &Path,
        file_name: &str,
    ) -> Result<(String, u64), StageError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| self.io_error(e))?;
        let size_bytes = bytes.len() as u64;
        let locator = stage_output_locator(job_id, self.stage.as_str(), file_name);

        let locator = objects
            .put(&locator, bytes)
            .await
            .map_err(|source| StageError::Storage {
                stage: self.stage,
                source,
            })?;
        Ok((locator, size_bytes))
    }

    fn io_error(&self, source: io::Error) -> StageError {
        StageError::Workspace {
            stage: self.stage,
            source,
        }
    }
}
