//! Dataflow graph shared by the tracer, the freezer and the ONNX lowering.

use std::fmt;

use crate::schema::DType;

/// One axis of a statically known shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    /// The dynamic batch axis.
    Batch,
    Fixed(usize),
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// Formats a shape as `[batch, 12, 12, 1]`.
pub fn shape_string(shape: &[Dim]) -> String {
    let dims: Vec<String> = shape.iter().map(Dim::to_string).collect();
    format!("[{}]", dims.join(", "))
}

/// Operations a traced policy can contain. Spatial ops work on
/// channel-first `[batch, channels, height, width]` tensors.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Declared graph input.
    Input,
    /// Reference to a live trainable parameter (traced graphs only).
    Variable,
    /// Frozen parameter value, row-major.
    Constant(Vec<f32>),
    Transpose {
        perm: Vec<usize>,
    },
    /// Valid (unpadded) convolution; inputs are `[x, weight, bias?]`.
    Conv2d {
        kernel: [usize; 2],
        stride: [usize; 2],
    },
    /// Valid max pooling with floor rounding.
    MaxPool2d {
        kernel: [usize; 2],
        stride: [usize; 2],
    },
    Relu,
    /// Collapses every axis after the batch axis.
    Flatten,
    /// Row lookup; inputs are `[table, indices]`.
    Gather,
    Concat {
        axis: usize,
    },
    /// `x · weight + bias`; inputs are `[x, weight, bias?]`.
    Dense,
    /// Softmax over the last axis.
    Softmax,
    Identity,
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Variable => "variable",
            Self::Constant(_) => "constant",
            Self::Transpose { .. } => "transpose",
            Self::Conv2d { .. } => "conv2d",
            Self::MaxPool2d { .. } => "max_pool2d",
            Self::Relu => "relu",
            Self::Flatten => "flatten",
            Self::Gather => "gather",
            Self::Concat { .. } => "concat",
            Self::Dense => "dense",
            Self::Softmax => "softmax",
            Self::Identity => "identity",
        }
    }
}

/// A node produces exactly one tensor, named after the node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<String>,
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

impl Node {
    /// Shape without the batch marker; `None` if any axis is dynamic.
    pub fn fixed_dims(&self) -> Option<Vec<usize>> {
        self.shape
            .iter()
            .map(|d| match d {
                Dim::Fixed(n) => Some(*n),
                Dim::Batch => None,
            })
            .collect()
    }
}

/// A tensor as seen by a consumer of the graph: name, element type, shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorBinding {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

impl TensorBinding {
    pub fn of(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            dtype: node.dtype,
            shape: node.shape.clone(),
        }
    }

    /// Size of the last axis, if it is fixed.
    pub fn width(&self) -> Option<usize> {
        match self.shape.last() {
            Some(Dim::Fixed(n)) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for TensorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{}", self.name, self.dtype, shape_string(&self.shape))
    }
}
