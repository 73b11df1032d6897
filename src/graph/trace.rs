//! Symbolic tracing of a model's forward pass into a concrete graph.
//!
//! A [`ServingFunction`] binds a model to a declared input signature. Tracing
//! it walks the model once, recording every operation with a fully bound
//! shape. Parameters are recorded as variable nodes that still borrow the
//! live module, so the borrow checker keeps the model unchanged until the
//! graph is frozen.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::TensorData;

use super::ir::{Dim, Node, Op, TensorBinding, shape_string};
use crate::error::TraceError;
use crate::schema::{DType, TensorSpec};

/// Reads the current value of a traced parameter.
pub(super) type ReadParam<'m> = Box<dyn Fn() -> TensorData + 'm>;

/// Handle to a tensor produced while tracing.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

impl Symbol {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Something with a fixed input signature and a symbolic forward pass.
pub trait Traceable {
    /// Inputs the model expects, in binding order.
    fn signature(&self) -> Vec<TensorSpec>;

    /// Records the forward pass into `tracer`; `inputs` follow
    /// [`Traceable::signature`] order. Returns the named outputs in order.
    fn trace_forward<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        inputs: &[Symbol],
    ) -> Result<Vec<(&'static str, Symbol)>, TraceError>;
}

/// Single pure function from the declared inputs to the model outputs.
pub struct ServingFunction<'m, M> {
    model: &'m M,
    signature: Vec<TensorSpec>,
}

impl<'m, M: Traceable> ServingFunction<'m, M> {
    /// Serving function over the model's own signature.
    pub fn new(model: &'m M) -> Self {
        Self {
            signature: model.signature(),
            model,
        }
    }

    /// Serving function over an explicitly declared signature, which must
    /// match the model's once every dimension is bound.
    pub fn with_signature(model: &'m M, signature: Vec<TensorSpec>) -> Self {
        Self { model, signature }
    }

    pub fn signature(&self) -> &[TensorSpec] {
        &self.signature
    }

    /// Traces the forward pass once against the declared signature.
    pub fn trace(&self) -> Result<TracedGraph<'m>, TraceError> {
        let mut tracer = Tracer::new();
        let inputs = self
            .signature
            .iter()
            .map(|spec| tracer.input(spec))
            .collect::<Result<Vec<_>, _>>()?;

        let expected = self.model.signature();
        if expected.len() != self.signature.len() {
            return Err(TraceError::InputCount {
                declared: self.signature.len(),
                expected: expected.len(),
            });
        }
        for (declared, expected) in self.signature.iter().zip(&expected) {
            let same_tail = declared.shape.get(1..) == expected.shape.get(1..);
            if declared.name != expected.name || declared.dtype != expected.dtype || !same_tail {
                return Err(TraceError::SignatureMismatch {
                    name: declared.name.clone(),
                    declared: declared.to_string(),
                    expected: format!("{} {}", expected.name, expected),
                });
            }
        }

        let outputs = self.model.trace_forward(&mut tracer, &inputs)?;
        let graph = tracer.finish(outputs)?;
        tracing::debug!(
            "Traced {} nodes ({} variables)",
            graph.nodes.len(),
            graph.variables.len()
        );
        Ok(graph)
    }
}

/// Records nodes with statically inferred shapes.
pub struct Tracer<'m> {
    nodes: Vec<Node>,
    variables: BTreeMap<String, ReadParam<'m>>,
    taken: HashSet<String>,
    inputs: Vec<String>,
}

impl<'m> Default for Tracer<'m> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m> Tracer<'m> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            variables: BTreeMap::new(),
            taken: HashSet::new(),
            inputs: Vec::new(),
        }
    }

    /// Declares a graph input. Only axis 0 (the batch axis) may be unbound.
    pub fn input(&mut self, spec: &TensorSpec) -> Result<Symbol, TraceError> {
        if spec.shape.is_empty() {
            return Err(TraceError::MissingBatchAxis {
                name: spec.name.clone(),
            });
        }
        let mut shape = Vec::with_capacity(spec.shape.len());
        for (axis, dim) in spec.shape.iter().enumerate() {
            shape.push(match (axis, dim) {
                (0, None) => Dim::Batch,
                (_, Some(n)) => Dim::Fixed(*n),
                (axis, None) => {
                    return Err(TraceError::UnboundDimension {
                        name: spec.name.clone(),
                        axis,
                    });
                }
            });
        }
        if self.taken.contains(&spec.name) {
            return Err(TraceError::Shape {
                node: spec.name.clone(),
                reason: "input name is already used".to_string(),
            });
        }
        self.inputs.push(spec.name.clone());
        Ok(self.emit(spec.name.clone(), Op::Input, Vec::new(), spec.dtype, shape))
    }

    /// Records a reference to a live parameter.
    pub fn variable<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        param: &'m Param<Tensor<B, D>>,
    ) -> Symbol {
        let name = self.unique(name);
        let shape = param.val().dims().iter().map(|&n| Dim::Fixed(n)).collect();
        self.variables
            .insert(name.clone(), Box::new(move || param.val().into_data()));
        self.emit(name, Op::Variable, Vec::new(), DType::F32, shape)
    }

    pub fn transpose(&mut self, name: &str, x: &Symbol, perm: &[usize]) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        let mut sorted = perm.to_vec();
        sorted.sort_unstable();
        if sorted != (0..x.rank()).collect::<Vec<_>>() {
            return Err(shape_error(&name, format!("{perm:?} is not a permutation of {}", shape_string(&x.shape))));
        }
        let shape = perm.iter().map(|&axis| x.shape[axis]).collect();
        Ok(self.emit(
            name,
            Op::Transpose { perm: perm.to_vec() },
            vec![x.name.clone()],
            x.dtype,
            shape,
        ))
    }

    /// Valid convolution over `[batch, channels, height, width]`.
    pub fn conv2d(
        &mut self,
        name: &str,
        x: &Symbol,
        weight: &Symbol,
        bias: Option<&Symbol>,
        stride: [usize; 2],
    ) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        expect_rank(&name, x, 4)?;
        expect_rank(&name, weight, 4)?;
        let channels = fixed(&name, x, 1)?;
        let [out_channels, in_channels, kh, kw] = [
            fixed(&name, weight, 0)?,
            fixed(&name, weight, 1)?,
            fixed(&name, weight, 2)?,
            fixed(&name, weight, 3)?,
        ];
        if channels != in_channels {
            return Err(shape_error(
                &name,
                format!("input has {channels} channels, kernel expects {in_channels}"),
            ));
        }
        let height = window_output(&name, fixed(&name, x, 2)?, kh, stride[0])?;
        let width = window_output(&name, fixed(&name, x, 3)?, kw, stride[1])?;

        let mut inputs = vec![x.name.clone(), weight.name.clone()];
        if let Some(bias) = bias {
            expect_vector(&name, bias, out_channels)?;
            inputs.push(bias.name.clone());
        }
        let shape = vec![x.shape[0], Dim::Fixed(out_channels), Dim::Fixed(height), Dim::Fixed(width)];
        Ok(self.emit(
            name,
            Op::Conv2d {
                kernel: [kh, kw],
                stride,
            },
            inputs,
            DType::F32,
            shape,
        ))
    }

    pub fn max_pool2d(
        &mut self,
        name: &str,
        x: &Symbol,
        kernel: [usize; 2],
        stride: [usize; 2],
    ) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        expect_rank(&name, x, 4)?;
        let height = window_output(&name, fixed(&name, x, 2)?, kernel[0], stride[0])?;
        let width = window_output(&name, fixed(&name, x, 3)?, kernel[1], stride[1])?;
        let shape = vec![x.shape[0], x.shape[1], Dim::Fixed(height), Dim::Fixed(width)];
        Ok(self.emit(
            name,
            Op::MaxPool2d { kernel, stride },
            vec![x.name.clone()],
            x.dtype,
            shape,
        ))
    }

    pub fn relu(&mut self, name: &str, x: &Symbol) -> Symbol {
        let name = self.unique(name);
        self.emit(name, Op::Relu, vec![x.name.clone()], x.dtype, x.shape.clone())
    }

    /// Collapses every axis after the batch axis.
    pub fn flatten(&mut self, name: &str, x: &Symbol) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        if x.rank() < 2 {
            return Err(shape_error(&name, "flatten needs a batch axis and at least one more"));
        }
        let mut features = 1;
        for axis in 1..x.rank() {
            features *= fixed(&name, x, axis)?;
        }
        Ok(self.emit(
            name,
            Op::Flatten,
            vec![x.name.clone()],
            x.dtype,
            vec![x.shape[0], Dim::Fixed(features)],
        ))
    }

    /// Looks up rows of `table` (`[rows, width]`) for integer `indices`.
    pub fn gather(&mut self, name: &str, table: &Symbol, indices: &Symbol) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        expect_rank(&name, table, 2)?;
        if indices.dtype != DType::I32 {
            return Err(shape_error(&name, format!("indices must be int32, got {}", indices.dtype)));
        }
        let mut shape = indices.shape.clone();
        shape.push(Dim::Fixed(fixed(&name, table, 1)?));
        Ok(self.emit(
            name,
            Op::Gather,
            vec![table.name.clone(), indices.name.clone()],
            table.dtype,
            shape,
        ))
    }

    pub fn concat(&mut self, name: &str, parts: &[Symbol], axis: usize) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        let Some(first) = parts.first() else {
            return Err(shape_error(&name, "nothing to concatenate"));
        };
        if axis == 0 || axis >= first.rank() {
            return Err(shape_error(&name, format!("cannot concatenate along axis {axis}")));
        }
        let mut total = 0;
        for part in parts {
            let compatible = part.rank() == first.rank()
                && part.dtype == first.dtype
                && part
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(shape_error(
                    &name,
                    format!(
                        "`{}` {} does not line up with {}",
                        part.name,
                        shape_string(&part.shape),
                        shape_string(&first.shape)
                    ),
                ));
            }
            total += fixed(&name, part, axis)?;
        }
        let mut shape = first.shape.clone();
        shape[axis] = Dim::Fixed(total);
        Ok(self.emit(
            name,
            Op::Concat { axis },
            parts.iter().map(|p| p.name.clone()).collect(),
            first.dtype,
            shape,
        ))
    }

    /// `x · weight + bias` with `weight` laid out `[in, out]`.
    pub fn dense(
        &mut self,
        name: &str,
        x: &Symbol,
        weight: &Symbol,
        bias: Option<&Symbol>,
    ) -> Result<Symbol, TraceError> {
        let name = self.unique(name);
        expect_rank(&name, x, 2)?;
        expect_rank(&name, weight, 2)?;
        let features = fixed(&name, x, 1)?;
        let d_in = fixed(&name, weight, 0)?;
        let d_out = fixed(&name, weight, 1)?;
        if features != d_in {
            return Err(shape_error(
                &name,
                format!("input has {features} features, weight expects {d_in}"),
            ));
        }
        let mut inputs = vec![x.name.clone(), weight.name.clone()];
        if let Some(bias) = bias {
            expect_vector(&name, bias, d_out)?;
            inputs.push(bias.name.clone());
        }
        Ok(self.emit(name, Op::Dense, inputs, DType::F32, vec![x.shape[0], Dim::Fixed(d_out)]))
    }

    pub fn softmax(&mut self, name: &str, x: &Symbol) -> Symbol {
        let name = self.unique(name);
        self.emit(name, Op::Softmax, vec![x.name.clone()], x.dtype, x.shape.clone())
    }

    /// Closes the trace. Each output is exposed under its exact name,
    /// through an identity node when the producing node is named otherwise.
    pub fn finish(mut self, outputs: Vec<(&str, Symbol)>) -> Result<TracedGraph<'m>, TraceError> {
        let mut names = Vec::with_capacity(outputs.len());
        for (name, symbol) in outputs {
            if names.iter().any(|n| n == name) {
                return Err(TraceError::DuplicateOutput(name.to_string()));
            }
            if symbol.name != name {
                if self.taken.contains(name) {
                    return Err(shape_error(name, "output name is already used by another node"));
                }
                self.emit(
                    name.to_string(),
                    Op::Identity,
                    vec![symbol.name.clone()],
                    symbol.dtype,
                    symbol.shape.clone(),
                );
            }
            names.push(name.to_string());
        }

        Ok(TracedGraph {
            nodes: self.nodes,
            variables: self.variables,
            inputs: self.inputs,
            outputs: names,
        })
    }

    fn unique(&mut self, name: &str) -> String {
        if !self.taken.contains(name) {
            return name.to_string();
        }
        (1..)
            .map(|i| format!("{name}_{i}"))
            .find(|candidate| !self.taken.contains(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    fn emit(&mut self, name: String, op: Op, inputs: Vec<String>, dtype: DType, shape: Vec<Dim>) -> Symbol {
        tracing::trace!("{} = {}({})", name, op.kind(), inputs.join(", "));
        self.taken.insert(name.clone());
        self.nodes.push(Node {
            name: name.clone(),
            op,
            inputs,
            dtype,
            shape: shape.clone(),
        });
        Symbol { name, dtype, shape }
    }
}

/// A traced graph whose variable nodes still borrow the live model.
pub struct TracedGraph<'m> {
    pub(super) nodes: Vec<Node>,
    pub(super) variables: BTreeMap<String, ReadParam<'m>>,
    pub(super) inputs: Vec<String>,
    pub(super) outputs: Vec<String>,
}

impl<'m> TracedGraph<'m> {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn inputs(&self) -> Vec<TensorBinding> {
        bindings(&self.nodes, &self.inputs)
    }

    pub fn outputs(&self) -> Vec<TensorBinding> {
        bindings(&self.nodes, &self.outputs)
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }
}

impl fmt::Debug for TracedGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedGraph")
            .field("nodes", &self.nodes.len())
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

pub(super) fn bindings(nodes: &[Node], names: &[String]) -> Vec<TensorBinding> {
    names
        .iter()
        .filter_map(|name| nodes.iter().find(|n| &n.name == name))
        .map(TensorBinding::of)
        .collect()
}

fn shape_error(node: &str, reason: impl Into<String>) -> TraceError {
    TraceError::Shape {
        node: node.to_string(),
        reason: reason.into(),
    }
}

fn expect_rank(node: &str, x: &Symbol, rank: usize) -> Result<(), TraceError> {
    if x.rank() != rank {
        return Err(shape_error(
            node,
            format!("`{}` has rank {}, expected {rank}", x.name, x.rank()),
        ));
    }
    Ok(())
}

fn expect_vector(node: &str, x: &Symbol, len: usize) -> Result<(), TraceError> {
    if x.shape != [Dim::Fixed(len)] {
        return Err(shape_error(
            node,
            format!("`{}` is {}, expected [{len}]", x.name, shape_string(&x.shape)),
        ));
    }
    Ok(())
}

fn fixed(node: &str, x: &Symbol, axis: usize) -> Result<usize, TraceError> {
    match x.shape.get(axis) {
        Some(Dim::Fixed(n)) => Ok(*n),
        _ => Err(shape_error(
            node,
            format!("axis {axis} of `{}` {} is not bound", x.name, shape_string(&x.shape)),
        )),
    }
}

fn window_output(node: &str, extent: usize, kernel: usize, stride: usize) -> Result<usize, TraceError> {
    if kernel == 0 || stride == 0 || extent < kernel {
        return Err(shape_error(
            node,
            format!("window {kernel} with stride {stride} does not fit extent {extent}"),
        ));
    }
    Ok((extent - kernel) / stride + 1)
}
