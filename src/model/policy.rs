//! The keep policy network: extractors, shared trunk and four heads.

use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use super::extractors::{KeepSummary, OwnershipExtractor, SpatialExtractor};
use super::output::PolicyOutput;
use crate::config::{OutputActivation, PolicyConfig};
use crate::error::{ConfigError, SchemaError, TraceError};
use crate::graph::{Op, ServingFunction, Symbol, TraceLayer, Traceable, Tracer};
use crate::schema::{
    ARCHER_PERCENT, InputSchema, PolicyInputs, SOLDIER_PERCENT, SOURCE_KEEP,
    TARGET_KEEP, TensorSpec,
};

/// Map, ownership and unit counts in; source keep, target keep and the
/// two commitment levels out.
///
/// The heads only share the trunk: given the latent vector, each head is
/// computed independently of the others.
#[derive(Module, Debug)]
pub struct KeepPolicy<B: Backend> {
    spatial: SpatialExtractor<B>,
    ownership: Option<OwnershipExtractor<B>>,
    keeps: KeepSummary<B>,
    trunk: Vec<Linear<B>>,
    source_head: Linear<B>,
    target_head: Linear<B>,
    soldier_head: Linear<B>,
    archer_head: Linear<B>,
    activation: Relu,
    schema: Ignored<InputSchema>,
    output_activation: Ignored<OutputActivation>,
}

impl<B: Backend> KeepPolicy<B> {
    /// Builds every layer for `config`. Nothing is allocated when the
    /// configuration is invalid.
    pub fn new(device: &B::Device, config: &PolicyConfig) -> Result<Self, ConfigError> {
        let schema = InputSchema::from_config(config)?;
        let [head_source, head_target, head_soldiers, head_archers] = schema.head_widths();
        let [wide, narrow] = config.trunk_widths;

        let ownership = config
            .n_players
            .map(|n_players| OwnershipExtractor::new(device, n_players, config.embedding_width));
        let fused = config.spatial_features() + config.keep_summary_width;

        tracing::debug!(
            "Building keep policy: map {:?}, {} keeps, ownership {}, {} fused features",
            config.input_shape,
            config.n_keeps,
            ownership.is_some(),
            fused
        );

        Ok(Self {
            spatial: SpatialExtractor::new(device, config),
            ownership,
            keeps: KeepSummary::new(device, config),
            trunk: vec![
                LinearConfig::new(fused, wide).init(device),
                LinearConfig::new(wide, narrow).init(device),
            ],
            source_head: LinearConfig::new(narrow, head_source).init(device),
            target_head: LinearConfig::new(narrow, head_target).init(device),
            soldier_head: LinearConfig::new(narrow, head_soldiers).init(device),
            archer_head: LinearConfig::new(narrow, head_archers).init(device),
            activation: Relu::new(),
            schema: Ignored(schema),
            output_activation: Ignored(config.output_activation),
        })
    }

    pub fn schema(&self) -> &InputSchema {
        &self.schema
    }

    pub fn output_activation(&self) -> OutputActivation {
        *self.output_activation
    }

    pub fn has_ownership_embedding(&self) -> bool {
        self.ownership.is_some()
    }

    /// Distinct owner ids accepted by the embedding, if there is one.
    pub fn ownership_cardinality(&self) -> Option<usize> {
        self.ownership.as_ref().map(OwnershipExtractor::cardinality)
    }

    /// Name and shape of every parameter, in trace order.
    pub fn parameter_shapes(&self) -> Result<Vec<(String, Vec<usize>)>, TraceError> {
        let graph = ServingFunction::new(self).trace()?;
        Ok(graph
            .nodes()
            .iter()
            .filter(|node| node.op == Op::Variable)
            .map(|node| (node.name.clone(), node.fixed_dims().unwrap_or_default()))
            .collect())
    }

    /// Runs the network. Inputs validated against another schema are
    /// checked again against this model's slots first.
    pub fn forward(&self, inputs: PolicyInputs<B>) -> Result<PolicyOutput<B>, SchemaError> {
        let (map, ownership, soldiers, archers) = inputs.revalidate(self.schema())?.into_tensors();

        let spatial = self.spatial.forward(map);
        let owners = match (&self.ownership, ownership) {
            (Some(extractor), Some(ids)) => Some(extractor.forward(ids)),
            (Some(_), None) => return Err(SchemaError::MissingOwnership),
            (None, Some(_)) => return Err(SchemaError::UnexpectedOwnership),
            (None, None) => None,
        };
        let keeps = self.keeps.forward(owners, soldiers, archers);

        let mut x = Tensor::cat(vec![spatial, keeps], 1);
        for layer in &self.trunk {
            x = self.activation.forward(layer.forward(x));
        }

        Ok(PolicyOutput {
            source: self.head(&self.source_head, x.clone()),
            target: self.head(&self.target_head, x.clone()),
            soldiers: self.head(&self.soldier_head, x.clone()),
            archers: self.head(&self.archer_head, x),
        })
    }

    fn head(&self, layer: &Linear<B>, latent: Tensor<B, 2>) -> Tensor<B, 2> {
        let scores = layer.forward(latent);
        match *self.output_activation {
            OutputActivation::Softmax => softmax(scores, 1),
            OutputActivation::Raw => scores,
        }
    }

    fn trace_head<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        layer: &'m Linear<B>,
        name: &str,
        latent: &Symbol,
    ) -> Result<Symbol, TraceError> {
        let scores = layer.trace(tracer, &format!("heads/{name}"), latent)?;
        Ok(match *self.output_activation {
            OutputActivation::Softmax => tracer.softmax(&format!("heads/{name}/softmax"), &scores),
            OutputActivation::Raw => scores,
        })
    }
}

impl<B: Backend> Traceable for KeepPolicy<B> {
    fn signature(&self) -> Vec<TensorSpec> {
        self.schema.signature()
    }

    fn trace_forward<'m>(
        &'m self,
        tracer: &mut Tracer<'m>,
        inputs: &[Symbol],
    ) -> Result<Vec<(&'static str, Symbol)>, TraceError> {
        let (map, ownership, soldiers, archers) = match (&self.ownership, inputs) {
            (Some(_), [map, ownership, soldiers, archers]) => (map, Some(ownership), soldiers, archers),
            (None, [map, soldiers, archers]) => (map, None, soldiers, archers),
            _ => {
                return Err(TraceError::InputCount {
                    declared: inputs.len(),
                    expected: self.schema.input_names().len(),
                });
            }
        };

        let spatial = self.spatial.trace(tracer, map)?;
        let owners = match (&self.ownership, ownership) {
            (Some(extractor), Some(ids)) => Some(extractor.trace(tracer, ids)?),
            _ => None,
        };
        let keeps = self.keeps.trace(tracer, owners.as_ref(), soldiers, archers)?;

        let mut x = tracer.concat("trunk/concat", &[spatial, keeps], 1)?;
        for (i, layer) in self.trunk.iter().enumerate() {
            let scope = format!("trunk/dense{}", i + 1);
            x = layer.trace(tracer, &scope, &x)?;
            x = tracer.relu(&format!("{scope}/relu"), &x);
        }

        let heads = [
            (SOURCE_KEEP, &self.source_head),
            (TARGET_KEEP, &self.target_head),
            (SOLDIER_PERCENT, &self.soldier_head),
            (ARCHER_PERCENT, &self.archer_head),
        ];
        let mut outputs = Vec::with_capacity(heads.len());
        for (name, layer) in heads {
            outputs.push((name, self.trace_head(tracer, layer, name, &x)?));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::graph::Dim;
    use crate::schema::{GameSnapshot, KEEP_OWNERSHIP, MAP_INPUT, OUTPUT_NAMES};

    type B = NdArray;

    fn small(n_players: Option<usize>) -> PolicyConfig {
        PolicyConfig::new([12, 12, 1], 5)
            .with_n_players(n_players)
            .with_conv_channels([4, 6])
            .with_keep_summary_width(16)
            .with_trunk_widths([32, 16])
    }

    fn snapshot(owner: u32) -> GameSnapshot {
        GameSnapshot {
            map: (0..144).map(|i| (i % 7) as f32 / 7.0).collect(),
            ownership: vec![owner, 0, 1, 2, 3],
            soldiers: vec![3.0, 0.0, 12.0, 5.0, 1.0],
            archers: vec![0.0, 4.0, 2.0, 0.0, 9.0],
        }
    }

    #[test]
    fn test_head_widths() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        let inputs = PolicyInputs::from_snapshots(model.schema(), &[snapshot(1), snapshot(2)], &device)
            .unwrap();

        let output = model.forward(inputs).unwrap();
        assert_eq!(output.head_widths(), [5, 5, 4, 4]);
        assert_eq!(output.batch_size(), 2);
    }

    #[test]
    fn test_softmax_heads_are_distributions() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        let inputs = PolicyInputs::from_snapshots(model.schema(), &[snapshot(0)], &device).unwrap();

        let output = model.forward(inputs).unwrap();
        for head in [output.source, output.target, output.soldiers, output.archers] {
            let total: f32 = head.sum().into_scalar();
            assert!((total - 1.0).abs() < 1e-4, "head sums to {total}");
        }
    }

    #[test]
    fn test_unowned_sentinel_is_accepted() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        assert_eq!(model.ownership_cardinality(), Some(4));

        // 3 == n_players marks an unowned keep
        let inputs = PolicyInputs::from_snapshots(model.schema(), &[snapshot(3)], &device).unwrap();
        let actions = model.forward(inputs).unwrap().greedy();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].source < 5 && actions[0].target < 5);
    }

    #[test]
    fn test_coarse_variant_has_no_ownership() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(None)).unwrap();
        assert!(!model.has_ownership_embedding());
        assert_eq!(model.ownership_cardinality(), None);

        let inputs = PolicyInputs::from_snapshots(model.schema(), &[snapshot(0)], &device).unwrap();
        assert!(inputs.ownership().is_none());
        assert_eq!(model.forward(inputs).unwrap().head_widths(), [5, 5, 4, 4]);
    }

    #[test]
    fn test_raw_heads_are_unnormalized() {
        let device = Default::default();
        let config = small(Some(3)).with_output_activation(OutputActivation::Raw);
        let model = KeepPolicy::<B>::new(&device, &config).unwrap();
        let inputs = PolicyInputs::from_snapshots(model.schema(), &[snapshot(0)], &device).unwrap();
        assert_eq!(model.output_activation(), OutputActivation::Raw);

        let raw = model.forward(inputs).unwrap();
        let scores = raw.source.clone().into_data().to_vec::<f32>().unwrap();
        let total: f32 = scores.iter().sum();
        assert!(
            (total - 1.0).abs() > 1e-3 || scores.iter().any(|&s| s < 0.0),
            "raw scores look like probabilities: {scores:?}"
        );

        let normalized: f32 = softmax(raw.source, 1).sum().into_scalar();
        assert!((normalized - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_forward_rejects_inputs_for_other_schema() {
        let device = Default::default();
        let fine = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        let coarse = KeepPolicy::<B>::new(&device, &small(None)).unwrap();

        let coarse_inputs =
            PolicyInputs::from_snapshots(coarse.schema(), &[snapshot(0)], &device).unwrap();
        let err = fine.forward(coarse_inputs).unwrap_err();
        assert!(matches!(err, SchemaError::MissingOwnership));

        let fine_inputs = PolicyInputs::from_snapshots(fine.schema(), &[snapshot(0)], &device).unwrap();
        let err = coarse.forward(fine_inputs).unwrap_err();
        assert!(matches!(err, SchemaError::UnexpectedOwnership));

        let larger_map = PolicyConfig::new([16, 16, 1], 5)
            .with_n_players(Some(3))
            .with_conv_channels([4, 6])
            .with_keep_summary_width(16)
            .with_trunk_widths([32, 16]);
        let wide = KeepPolicy::<B>::new(&device, &larger_map).unwrap();
        let err = wide
            .forward(PolicyInputs::from_snapshots(fine.schema(), &[snapshot(0)], &device).unwrap())
            .unwrap_err();
        assert!(matches!(err, SchemaError::ShapeMismatch { name: MAP_INPUT, .. }));
    }

    #[test]
    fn test_invalid_config_builds_nothing() {
        let device = Default::default();
        let err = KeepPolicy::<B>::new(&device, &PolicyConfig::new([12, 12, 1], 0)).unwrap_err();
        assert!(matches!(err, ConfigError::NoKeeps));
    }

    #[test]
    fn test_trace_matches_forward_shapes() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        let graph = ServingFunction::new(&model).trace().unwrap();

        let inputs: Vec<String> = graph.inputs().into_iter().map(|b| b.name).collect();
        assert_eq!(inputs, vec![MAP_INPUT, KEEP_OWNERSHIP, "soldier_counts", "archer_counts"]);

        let outputs = graph.outputs();
        let names: Vec<&str> = outputs.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, OUTPUT_NAMES);
        let widths: Vec<Option<usize>> = outputs.iter().map(|b| b.width()).collect();
        assert_eq!(widths, vec![Some(5), Some(5), Some(4), Some(4)]);
        assert!(outputs.iter().all(|b| b.shape[0] == Dim::Batch));

        assert_eq!(graph.node("spatial/flatten").unwrap().shape, vec![Dim::Batch, Dim::Fixed(6)]);
        assert_eq!(graph.node("heads/source_keep/softmax").unwrap().op, Op::Softmax);
        assert_eq!(graph.node("ownership/embedding/weight").unwrap().shape[0], Dim::Fixed(4));
    }

    #[test]
    fn test_unspecified_map_height_is_rejected() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        let mut signature = model.signature();
        assert_eq!(signature[0].name, MAP_INPUT);
        signature[0].shape[1] = None;

        let err = ServingFunction::with_signature(&model, signature)
            .trace()
            .unwrap_err();
        assert!(matches!(
            err,
            TraceError::UnboundDimension { ref name, axis: 1 } if name == MAP_INPUT
        ));
    }

    #[test]
    fn test_parameter_shapes_follow_config() {
        let device = Default::default();
        let model = KeepPolicy::<B>::new(&device, &small(Some(3))).unwrap();
        let shapes = model.parameter_shapes().unwrap();

        let find = |name: &str| {
            shapes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, dims)| dims.clone())
        };
        assert_eq!(find("spatial/conv1/weight"), Some(vec![4, 1, 3, 3]));
        assert_eq!(find("ownership/embedding/weight"), Some(vec![4, 8]));
        assert_eq!(find("trunk/dense1/weight"), Some(vec![6 + 16, 32]));
        assert_eq!(find("heads/archer_percent/bias"), Some(vec![4]));
    }

    #[test]
    fn test_trace_raw_has_no_softmax() {
        let device = Default::default();
        let config = small(None).with_output_activation(OutputActivation::Raw);
        let model = KeepPolicy::<B>::new(&device, &config).unwrap();
        let graph = ServingFunction::new(&model).trace().unwrap();

        assert!(graph.nodes().iter().all(|n| n.op != Op::Softmax));
        assert_eq!(graph.inputs().len(), 3);
        assert_eq!(graph.node(SOURCE_KEEP).unwrap().op, Op::Identity);
    }
}
