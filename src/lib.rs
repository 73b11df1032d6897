pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod objective;
pub mod pipeline;
pub mod schema;
pub mod train;

// Re-export commonly used types for convenience
pub use config::{ExportSettings, OutputActivation, PolicyConfig, Variant};
pub use error::{PipelineError, Result};
pub use model::{CommitLevel, KeepAction, KeepPolicy, PolicyOutput};
pub use objective::{ActionTargets, MultiHeadLoss};
pub use pipeline::{ExportPipeline, ExportReport, export_policy, freeze_policy};
pub use schema::{GameSnapshot, InputSchema, PolicyInputs};
pub use train::{CompiledPolicy, PolicyBatch, PolicyStepOutput};
