//! Inference graph construction: tracing, freezing and ONNX export.

pub mod export;
pub mod freeze;
pub mod ir;
pub mod layers;
pub mod onnx;
pub mod trace;

pub use export::{ArtifactContract, Metadata, write_artifact};
pub use freeze::FrozenGraph;
pub use ir::{Dim, Node, Op, TensorBinding};
pub use layers::TraceLayer;
pub use trace::{ServingFunction, Symbol, Traceable, TracedGraph, Tracer};
