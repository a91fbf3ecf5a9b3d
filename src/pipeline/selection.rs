//! Stage names and the fixed set of pipeline shapes a job can request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// One opaque compute step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Sequence/structure co-design (DiffAb).
    Design,
    /// Backbone generation (RFdiffusion).
    Backbone,
    /// Structure prediction (AlphaFold2).
    Prediction,
}

impl Stage {
    /// Canonical execution order.
    pub const ALL: [Stage; 3] = [Stage::Design, Stage::Backbone, Stage::Prediction];

    /// Stage name used in paths, logs and storage locators.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Design => "design",
            Stage::Backbone => "backbone",
            Stage::Prediction => "prediction",
        }
    }

    /// Name of the model the stage wraps.
    pub fn model_name(&self) -> &'static str {
        match self {
            Stage::Design => "diffab",
            Stage::Backbone => "rfdiffusion",
            Stage::Prediction => "af2",
        }
    }

    /// Whether the stage must emit a metrics side-file to count as successful.
    pub fn requires_metrics(&self) -> bool {
        matches!(self, Stage::Prediction)
    }

    /// Parses a stage name or one of its model aliases.
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        match name.trim().to_lowercase().as_str() {
            "design" | "diffab" => Ok(Stage::Design),
            "backbone" | "rfdiffusion" => Ok(Stage::Backbone),
            "prediction" | "af2" | "alphafold2" | "alphafold" => Ok(Stage::Prediction),
            other => Err(ValidationError::UnknownStage(other.to_string())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline shape selected for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "stages", rename_all = "snake_case")]
pub enum PipelineKind {
    DesignOnly,
    BackboneOnly,
    PredictionOnly,
    /// An ordered subset of stages chained through first-artifact handoff.
    FullChain(Vec<Stage>),
}

impl PipelineKind {
    /// Builds a chain from any selection of stages.
    ///
    /// Stages are put into canonical order and de-duplicated. An empty
    /// selection means every stage.
    pub fn full_chain(selected: impl IntoIterator<Item = Stage>) -> Self {
        PipelineKind::FullChain(normalize(selected.into_iter().collect()))
    }

    /// Parses a pipeline name together with an optional stage selection.
    ///
    /// The selection only applies to chained pipelines.
    pub fn parse(pipeline_type: &str, selected: &[String]) -> Result<Self, ValidationError> {
        match pipeline_type.trim().to_lowercase().as_str() {
            "design_only" | "diffab_only" => Ok(PipelineKind::DesignOnly),
            "backbone_only" | "rfdiffusion_only" => Ok(PipelineKind::BackboneOnly),
            "prediction_only" | "af2_only" => Ok(PipelineKind::PredictionOnly),
            "full_chain" | "full" | "diffab_rfdiffusion_af2" => {
                let stages = selected
                    .iter()
                    .map(|name| Stage::parse(name))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PipelineKind::full_chain(stages))
            }
            other => Err(ValidationError::UnknownPipeline(other.to_string())),
        }
    }

    /// The stages this pipeline runs, in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            PipelineKind::DesignOnly => vec![Stage::Design],
            PipelineKind::BackboneOnly => vec![Stage::Backbone],
            PipelineKind::PredictionOnly => vec![Stage::Prediction],
            PipelineKind::FullChain(stages) => normalize(stages.clone()),
        }
    }

    /// Stable name used in storage and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::DesignOnly => "design_only",
            PipelineKind::BackboneOnly => "backbone_only",
            PipelineKind::PredictionOnly => "prediction_only",
            PipelineKind::FullChain(_) => "full_chain",
        }
    }
}

impl Default for PipelineKind {
    fn default() -> Self {
        PipelineKind::full_chain([])
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = self.stages().iter().map(Stage::as_str).collect();
        write!(f, "{}[{}]", self.name(), stages.join(","))
    }
}

fn normalize(selected: Vec<Stage>) -> Vec<Stage> {
    if selected.is_empty() {
        return Stage::ALL.to_vec();
    }
    Stage::ALL
        .into_iter()
        .filter(|stage| selected.contains(stage))
        .collect()
}
