//! Replaces variable references by their current values.

use super::ir::{Node, Op, TensorBinding};
use super::trace::{TracedGraph, bindings};
use crate::error::FreezeError;

/// A graph with no remaining mutable state: every parameter is a constant.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenGraph {
    nodes: Vec<Node>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl TracedGraph<'_> {
    /// Reads every traced parameter once and folds it into a constant node.
    pub fn freeze(self) -> Result<FrozenGraph, FreezeError> {
        let TracedGraph {
            mut nodes,
            variables,
            inputs,
            outputs,
        } = self;

        let mut folded = 0usize;
        for node in nodes.iter_mut().filter(|n| n.op == Op::Variable) {
            let read = variables
                .get(&node.name)
                .ok_or_else(|| FreezeError::Unbound(node.name.clone()))?;
            let data = read();

            let traced = node.fixed_dims().unwrap_or_default();
            if data.shape != traced {
                return Err(FreezeError::StaleVariable {
                    node: node.name.clone(),
                    traced,
                    current: data.shape.clone(),
                });
            }

            let values = data
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| FreezeError::Read {
                    node: node.name.clone(),
                    reason: format!("{e:?}"),
                })?;
            tracing::trace!("Folded {} ({} values)", node.name, values.len());
            node.op = Op::Constant(values);
            folded += 1;
        }

        tracing::info!("Froze graph: {} nodes, {} constants", nodes.len(), folded);
        Ok(FrozenGraph {
            nodes,
            inputs,
            outputs,
        })
    }
}

impl FrozenGraph {
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

    pub fn constants(&self) -> impl Iterator<Item = (&Node, &[f32])> {
        self.nodes.iter().filter_map(|n| match &n.op {
            Op::Constant(values) => Some((n, values.as_slice())),
            _ => None,
        })
    }

    /// Total number of frozen parameter values.
    pub fn parameter_count(&self) -> usize {
        self.constants().map(|(_, values)| values.len()).sum()
    }
}
