//! Feature extractors: one sub-network per input modality.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig, Relu};
use burn::prelude::*;

use crate::config::PolicyConfig;
use crate::error::TraceError;
use crate::graph::{Symbol, TraceLayer, Tracer};

/// Two conv/pool stages over the map, flattened channel-first.
#[derive(Module, Debug)]
pub struct SpatialExtractor<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    activation: Relu,
    pool_size: Ignored<usize>,
}

impl<B: Backend> SpatialExtractor<B> {
    pub fn new(device: &B::Device, config: &PolicyConfig) -> Self {
        let [_, _, channels] = config.input_shape;
        let [c1, c2] = config.conv_channels;
        let kernel = [config.kernel_size, config.kernel_size];
        let pool = [config.pool_size, config.pool_size];

        Self {
            conv1: Conv2dConfig::new([channels, c1], kernel).init(device),
            conv2: Conv2dConfig::new([c1, c2], kernel).init(device),
            pool: MaxPool2dConfig::new(pool).with_strides(pool).init(),
            activation: Relu::new(),
            pool_size: Ignored(config.pool_size),
        }
    }

    /// map: [batch, height, width, channels] -> [batch, features]
    pub fn forward(&self, map: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = map.permute([0, 3, 1, 2]);
        let x = self.pool.forward(self.activation.forward(self.conv1.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        x.flatten(1, 3)
    }

    pub fn trace<'m>(&'m self, tracer: &mut Tracer<'m>, map: &Symbol) -> Result<Symbol, TraceError> {
        let pool = [*self.pool_size, *self.pool_size];

        let x = tracer.transpose("spatial/to_nchw", map, &[0, 3, 1, 2])?;
        let x = self.conv1.trace(tracer, "spatial/conv1", &x)?;
        let x = tracer.relu("spatial/conv1/relu", &x);
        let x = tracer.max_pool2d("spatial/pool1", &x, pool, pool)?;
        let x = self.conv2.trace(tracer, "spatial/conv2", &x)?;
        let x = tracer.relu("spatial/conv2/relu", &x);
        let x = tracer.max_pool2d("spatial/pool2", &x, pool, pool)?;
        tracer.flatten("spatial/flatten", &x)
    }
}

/// Learned embedding of each keep's owner, flattened across keeps.
#[derive(Module, Debug)]
pub struct OwnershipExtractor<B: Backend> {
    embedding: Embedding<B>,
}

impl<B: Backend> OwnershipExtractor<B> {
    /// One row per player plus the trailing "unowned" id.
    pub fn new(device: &B::Device, n_players: usize, width: usize) -> Self {
        Self {
            embedding: EmbeddingConfig::new(n_players + 1, width).init(device),
        }
    }

    /// Number of distinct ids the table accepts.
    pub fn cardinality(&self) -> usize {
        self.embedding.weight.dims()[0]
    }

    pub fn width(&self) -> usize {
        self.embedding.weight.dims()[1]
    }

    /// ids: [batch, n_keeps] -> [batch, n_keeps * width]
    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        self.embedding.forward(ids).flatten(1, 2)
    }

    pub fn trace<'m>(&'m self, tracer: &mut Tracer<'m>, ids: &Symbol) -> Result<Symbol, TraceError> {
        let rows = self.embedding.trace(tracer, "ownership/embedding", ids)?;
        tracer.flatten("ownership/flatten", &rows)
    }
}

/// Dense summary over per-keep features: ownership embedding (when
/// present) followed by soldier and archer counts.
#[derive(Module, Debug)]
pub struct KeepSummary<B: Backend> {
    dense: Linear<B>,
    activation: Relu,
}

impl<B: Backend> KeepSummary<B> {
    pub fn new(device: &B::Device, config: &PolicyConfig) -> Self {
        Self {
            dense: LinearConfig::new(config.keep_features(), config.keep_summary_width).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(
        &self,
        ownership: Option<Tensor<B, 2>>,
        soldiers: Tensor<B, 2>,
        archers: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let mut parts = Vec::with_capacity(3);
        parts.extend(ownership);
        parts.push(soldiers);
        parts.push(archers);
        self.activation.forward(self.dense.forward(Tensor::cat(parts, 1)))
    }

    pub fn trace<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        ownership: Option<&Symbol>,
        soldiers: &Symbol,
        archers: &Symbol,
    ) -> Result<Symbol, TraceError> {
        let mut parts = Vec::with_capacity(3);
        parts.extend(ownership.cloned());
        parts.push(soldiers.clone());
        parts.push(archers.clone());

        let x = tracer.concat("keeps/concat", &parts, 1)?;
        let x = self.dense.trace(tracer, "keeps/dense", &x)?;
        Ok(tracer.relu("keeps/relu", &x))
    }
}
