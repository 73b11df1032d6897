//! Error types for every phase of the construct → freeze → persist pipeline.
//!
//! Each phase fails terminally: nothing here is retried or recovered
//! locally, the error is surfaced to the operator and the run aborts.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid or mismatched configuration, raised before any module is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("map shape {height}x{width}x{channels} must be non-zero in every dimension")]
    EmptyMap {
        height: usize,
        width: usize,
        channels: usize,
    },

    #[error("map {height}x{width} is too small for two convolution and pooling stages")]
    MapTooSmall { height: usize, width: usize },

    #[error("n_keeps must be at least 1")]
    NoKeeps,

    #[error("n_players must be at least 1 when the ownership embedding is enabled")]
    NoPlayers,

    #[error("layer width `{0}` must be non-zero")]
    ZeroWidth(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidSetting {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to load policy config from {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
}

/// Inputs that do not match the schema of the compiled model.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("input `{name}` expects shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("input `{name}` has batch size {actual}, expected {expected}")]
    BatchMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("ownership input is required by this configuration")]
    MissingOwnership,

    #[error("ownership input is not part of this configuration")]
    UnexpectedOwnership,

    #[error("ownership id {value} is outside [0, {max}]")]
    OwnershipOutOfRange { value: i64, max: usize },

    #[error("snapshot {index}: `{name}` has {actual} values, expected {expected}")]
    SnapshotLength {
        index: usize,
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch row {index}: `{name}` holds a negative unit count")]
    NegativeCount { index: usize, name: &'static str },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("label {value} for `{head}` is outside [0, {width})")]
    LabelOutOfRange {
        head: &'static str,
        value: i64,
        width: usize,
    },
}

/// Failures while tracing the serving function into a concrete graph.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("input `{name}` has an unbound non-batch dimension at axis {axis}")]
    UnboundDimension { name: String, axis: usize },

    #[error("input `{name}` has no batch axis")]
    MissingBatchAxis { name: String },

    #[error("input `{name}` is declared as {declared} but the model expects {expected}")]
    SignatureMismatch {
        name: String,
        declared: String,
        expected: String,
    },

    #[error("signature declares {declared} inputs but the model takes {expected}")]
    InputCount { declared: usize, expected: usize },

    #[error("node `{node}`: {reason}")]
    Shape { node: String, reason: String },

    #[error("output `{0}` is declared more than once")]
    DuplicateOutput(String),

    #[error("stale model reference: {0}")]
    StaleModel(String),
}

/// Failures while replacing variable references by constants.
#[derive(Debug, Error)]
pub enum FreezeError {
    #[error("variable `{0}` has no bound parameter")]
    Unbound(String),

    #[error("variable `{node}` was traced as {traced:?} but now holds {current:?}")]
    StaleVariable {
        node: String,
        traced: Vec<usize>,
        current: Vec<usize>,
    },

    #[error("variable `{node}` could not be read: {reason}")]
    Read { node: String, reason: String },
}

/// Filesystem and decoding failures around the artifact file.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write artifact {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read artifact {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {} is not a valid model: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },

    #[error("artifact declares an invalid tensor `{name}`: {reason}")]
    InvalidTensor { name: String, reason: String },

    #[error("artifact has no graph")]
    MissingGraph,

    #[error("failed to save checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },
}

/// Any failure of the export pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Freeze(#[from] FreezeError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
