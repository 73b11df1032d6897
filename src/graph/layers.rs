//! Symbolic forms of the burn layers used by the policy.

use burn::nn::conv::Conv2d;
use burn::nn::{Embedding, Linear};
use burn::prelude::*;

use super::trace::{Symbol, Tracer};
use crate::error::TraceError;

/// A layer that can record itself into a [`Tracer`] under `scope`.
pub trait TraceLayer {
    fn trace<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        scope: &str,
        input: &Symbol,
    ) -> Result<Symbol, TraceError>;
}

impl<B: Backend> TraceLayer for Linear<B> {
    fn trace<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        scope: &str,
        input: &Symbol,
    ) -> Result<Symbol, TraceError> {
        let weight = tracer.variable(&format!("{scope}/weight"), &self.weight);
        let bias = self
            .bias
            .as_ref()
            .map(|bias| tracer.variable(&format!("{scope}/bias"), bias));
        tracer.dense(scope, input, &weight, bias.as_ref())
    }
}

/// Unit stride, valid padding: the only convolution the policy builds.
impl<B: Backend> TraceLayer for Conv2d<B> {
    fn trace<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        scope: &str,
        input: &Symbol,
    ) -> Result<Symbol, TraceError> {
        let weight = tracer.variable(&format!("{scope}/weight"), &self.weight);
        let bias = self
            .bias
            .as_ref()
            .map(|bias| tracer.variable(&format!("{scope}/bias"), bias));
        tracer.conv2d(scope, input, &weight, bias.as_ref(), [1, 1])
    }
}

/// Gathers rows of the embedding table for integer ids.
impl<B: Backend> TraceLayer for Embedding<B> {
    fn trace<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        scope: &str,
        input: &Symbol,
    ) -> Result<Symbol, TraceError> {
        let table = tracer.variable(&format!("{scope}/weight"), &self.weight);
        tracer.gather(scope, &table, input)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::nn::LinearConfig;

    use super::*;
    use crate::graph::ir::{Dim, Op};
    use crate::schema::{DType, TensorSpec};

    type B = NdArray;

    #[test]
    fn test_linear_records_weight_and_bias() {
        let layer = LinearConfig::new(6, 2).init::<B>(&Default::default());
        let mut tracer = Tracer::new();
        let x = tracer
            .input(&TensorSpec::batched("x", DType::F32, &[6]))
            .unwrap();
        let y = layer.trace(&mut tracer, "head", &x).unwrap();
        assert_eq!(y.name, "head");
        assert_eq!(y.shape, vec![Dim::Batch, Dim::Fixed(2)]);

        let graph = tracer.finish(vec![("head", y)]).unwrap();
        assert_eq!(graph.node("head/weight").unwrap().op, Op::Variable);
        assert_eq!(
            graph.node("head/weight").unwrap().shape,
            vec![Dim::Fixed(6), Dim::Fixed(2)]
        );
        assert!(graph.node("head/bias").is_some());
        assert_eq!(graph.node("head").unwrap().inputs, vec!["x", "head/weight", "head/bias"]);
    }
}
