//! Compiled policy: the model paired with its objective and optimizer,
//! plus checkpoint I/O and the step hooks burn's learner drives.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::ElementConversion;
use burn::tensor::backend::AutodiffBackend;

use crate::config::PolicyConfig;
use crate::error::{ConfigError, ExportError, PipelineError, SchemaError, TraceError};
use crate::model::{KeepPolicy, PolicyOutput};
use crate::objective::{ActionTargets, MultiHeadLoss};
use crate::schema::PolicyInputs;

/// Adam step size used when the policy is compiled.
pub const LEARNING_RATE: f64 = 1e-3;

/// File extension the checkpoint recorder appends.
const CHECKPOINT_EXTENSION: &str = "mpk";
/// Extension of the config saved next to each checkpoint.
const CONFIG_EXTENSION: &str = "json";

/// One supervised batch: encoded game states and the actions to imitate.
#[derive(Debug, Clone)]
pub struct PolicyBatch<B: Backend> {
    pub inputs: PolicyInputs<B>,
    pub targets: ActionTargets<B>,
}

/// Result of one forward step over a [`PolicyBatch`].
#[derive(Debug, Clone)]
pub struct PolicyStepOutput<B: Backend> {
    /// Summed objective, `[1]`.
    pub loss: Tensor<B, 1>,
    pub output: PolicyOutput<B>,
}

impl<B: Backend> KeepPolicy<B> {
    /// The objective matching this model's output activation.
    pub fn objective(&self) -> MultiHeadLoss {
        MultiHeadLoss::new(self.output_activation())
    }

    pub fn forward_step(&self, batch: PolicyBatch<B>) -> Result<PolicyStepOutput<B>, SchemaError> {
        let output = self.forward(batch.inputs)?;
        let loss = self.objective().forward(&output, &batch.targets);
        Ok(PolicyStepOutput { loss, output })
    }

    /// Step used by burn's learner, which has no error channel.
    ///
    /// # Panics
    ///
    /// If the batch was encoded for a different input schema.
    #[cfg(feature = "train")]
    fn learner_step(&self, batch: PolicyBatch<B>) -> PolicyStepOutput<B> {
        match self.forward_step(batch) {
            Ok(item) => item,
            Err(e) => panic!("batch does not fit the keep policy: {e}"),
        }
    }
}

#[cfg(feature = "train")]
impl<B: AutodiffBackend> burn::train::TrainStep<PolicyBatch<B>, PolicyStepOutput<B>> for KeepPolicy<B> {
    fn step(&self, batch: PolicyBatch<B>) -> burn::train::TrainOutput<PolicyStepOutput<B>> {
        let item = self.learner_step(batch);
        burn::train::TrainOutput::new(self, item.loss.backward(), item)
    }
}

#[cfg(feature = "train")]
impl<B: Backend> burn::train::ValidStep<PolicyBatch<B>, PolicyStepOutput<B>> for KeepPolicy<B> {
    fn step(&self, batch: PolicyBatch<B>) -> PolicyStepOutput<B> {
        self.learner_step(batch)
    }
}

/// A constructed policy ready for training or export.
pub struct CompiledPolicy<B: Backend> {
    pub model: KeepPolicy<B>,
    config: PolicyConfig,
    optimizer: AdamConfig,
    device: B::Device,
}

// AdamConfig has no Debug impl
impl<B: Backend> fmt::Debug for CompiledPolicy<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPolicy")
            .field("model", &self.model)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyConfig {
    /// Builds the model and attaches the objective and an Adam optimizer.
    pub fn compile<B: Backend>(&self, device: &B::Device) -> Result<CompiledPolicy<B>, ConfigError> {
        let model = KeepPolicy::new(device, self)?;
        tracing::info!(
            "Compiled keep policy ({} parameters, {} outputs)",
            model.num_params(),
            self.output_activation
        );
        Ok(CompiledPolicy {
            model,
            config: self.clone(),
            optimizer: AdamConfig::new(),
            device: device.clone(),
        })
    }
}

impl<B: Backend> CompiledPolicy<B> {
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn objective(&self) -> MultiHeadLoss {
        self.model.objective()
    }

    pub fn optimizer_config(&self) -> &AdamConfig {
        &self.optimizer
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Writes the parameters next to `path` (the recorder adds `.mpk`) and
    /// the config as `.json`. Returns the parameter file written.
    pub fn save_checkpoint(&self, path: &Path) -> Result<PathBuf, ExportError> {
        let file = checkpoint_file(path);
        let config_file = path.with_extension(CONFIG_EXTENSION);
        self.config
            .save(&config_file)
            .map_err(|source| ExportError::Write {
                path: config_file,
                source,
            })?;

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model
            .clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| ExportError::Checkpoint {
                path: file.clone(),
                reason: format!("{e:?}"),
            })?;
        tracing::info!("Saved checkpoint to {}", file.display());
        Ok(file)
    }

    /// Replaces the parameters with a saved record. A record built for a
    /// different topology is rejected and the current model is kept.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), PipelineError> {
        let file = checkpoint_file(path);
        if !file.is_file() {
            return Err(ExportError::Read {
                path: file,
                source: io::Error::new(io::ErrorKind::NotFound, "checkpoint not found"),
            }
            .into());
        }

        let config_file = path.with_extension(CONFIG_EXTENSION);
        match PolicyConfig::load(&config_file) {
            Ok(saved) if !saved.same_topology(&self.config) => {
                return Err(TraceError::StaleModel(format!(
                    "{} was saved for {saved}",
                    file.display()
                ))
                .into());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                "No usable config next to {} ({}), checking parameter shapes only",
                file.display(),
                e
            ),
        }

        let expected = self.model.parameter_shapes()?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let model = self
            .model
            .clone()
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|e| TraceError::StaleModel(format!("{}: {e:?}", file.display())))?;

        let loaded = model
            .parameter_shapes()
            .map_err(|e| TraceError::StaleModel(format!("{}: {e}", file.display())))?;
        if loaded != expected {
            return Err(TraceError::StaleModel(format!(
                "{} does not match the configured topology",
                file.display()
            ))
            .into());
        }

        self.model = model;
        tracing::info!("Loaded checkpoint from {}", file.display());
        Ok(())
    }
}

impl<B: AutodiffBackend> CompiledPolicy<B> {
    pub fn optimizer(&self) -> impl Optimizer<KeepPolicy<B>, B> + use<B> {
        self.optimizer.init::<B, KeepPolicy<B>>()
    }

    /// One gradient step on `batch`; returns the loss before the update.
    pub fn fit_batch<O: Optimizer<KeepPolicy<B>, B>>(
        &mut self,
        optimizer: &mut O,
        batch: PolicyBatch<B>,
    ) -> Result<f32, SchemaError> {
        let step = self.model.forward_step(batch)?;
        let loss = step.loss.clone().into_scalar().elem::<f32>();

        let grads = GradientsParams::from_grads(step.loss.backward(), &self.model);
        self.model = optimizer.step(LEARNING_RATE, self.model.clone(), grads);
        tracing::debug!("Fitted batch: loss = {:.4}", loss);
        Ok(loss)
    }
}

fn checkpoint_file(path: &Path) -> PathBuf {
    path.with_extension(CHECKPOINT_EXTENSION)
}
