//! The one-shot export run: construct, restore, freeze, persist.
//!
//! Every phase consumes the previous phase's output and any error aborts
//! the run. Nothing is retried.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;

use crate::config::ExportSettings;
use crate::error::{ExportError, PipelineError};
use crate::graph::{ArtifactContract, FrozenGraph, Metadata, ServingFunction, write_artifact};
use crate::model::KeepPolicy;

/// Name of the graph inside the artifact.
pub const GRAPH_NAME: &str = "keep_policy";

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub artifact: PathBuf,
    pub bytes: u64,
    pub parameters: usize,
    /// Inputs and outputs as read back from the written file.
    pub contract: ArtifactContract,
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Frozen model saved to {} ({} bytes, {} parameters)",
            self.artifact.display(),
            self.bytes,
            self.parameters
        )?;
        write!(f, "{}", self.contract)
    }
}

pub struct ExportPipeline {
    settings: ExportSettings,
}

impl ExportPipeline {
    pub fn new(settings: ExportSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn run<B: Backend>(&self, device: &B::Device) -> Result<ExportReport, PipelineError> {
        let settings = &self.settings;

        tracing::info!("Constructing {} policy", variant_label(settings));
        let mut compiled = settings.policy.compile::<B>(device)?;

        match &settings.checkpoint {
            Some(path) => compiled.load_checkpoint(path)?,
            None => tracing::warn!("No checkpoint configured, exporting initial weights"),
        }

        tracing::info!("Tracing and freezing");
        let frozen = freeze_policy(&compiled.model)?;
        drop(compiled);
        let parameters = frozen.parameter_count();

        tracing::info!("Persisting to {}", settings.output_dir.display());
        let metadata = policy_metadata(settings);
        let artifact = persist(frozen, &metadata, &settings.output_dir, &settings.artifact_name)?;

        let contract = ArtifactContract::read(&artifact)?;
        let bytes = fs::metadata(&artifact)
            .map_err(|source| ExportError::Read {
                path: artifact.clone(),
                source,
            })?
            .len();

        Ok(ExportReport {
            artifact,
            bytes,
            parameters,
            contract,
        })
    }
}

/// Traces the serving function of `model` and folds its parameters.
pub fn freeze_policy<B: Backend>(model: &KeepPolicy<B>) -> Result<FrozenGraph, PipelineError> {
    let traced = ServingFunction::new(model).trace()?;
    Ok(traced.freeze()?)
}

/// Freezes `model` and writes it to `dir/file_name`.
pub fn export_policy<B: Backend>(
    model: &KeepPolicy<B>,
    dir: &Path,
    file_name: &str,
) -> Result<PathBuf, PipelineError> {
    let mut metadata = vec![(
        "output_activation".to_string(),
        model.output_activation().to_string(),
    )];
    metadata.push(("n_keeps".to_string(), model.schema().n_keeps.to_string()));
    persist(freeze_policy(model)?, &metadata, dir, file_name)
}

fn persist(
    frozen: FrozenGraph,
    metadata: &Metadata,
    dir: &Path,
    file_name: &str,
) -> Result<PathBuf, PipelineError> {
    let model = frozen.to_onnx(GRAPH_NAME, metadata);
    // the lowered model owns its own copy of every parameter
    drop(frozen);
    Ok(write_artifact(&model, dir, file_name)?)
}

fn policy_metadata(settings: &ExportSettings) -> Metadata {
    let policy = &settings.policy;
    let mut metadata = vec![
        ("variant".to_string(), variant_label(settings).to_string()),
        ("output_activation".to_string(), policy.output_activation.to_string()),
        ("n_keeps".to_string(), policy.n_keeps.to_string()),
        ("input_shape".to_string(), format!("{:?}", policy.input_shape)),
    ];
    if let Some(n_players) = policy.n_players {
        metadata.push(("n_players".to_string(), n_players.to_string()));
    }
    metadata
}

fn variant_label(settings: &ExportSettings) -> &'static str {
    if settings.policy.has_ownership_embedding() {
        "fine-grained"
    } else {
        "coarse"
    }
}
