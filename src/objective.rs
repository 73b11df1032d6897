//! Multi-head categorical cross-entropy over the four policy heads.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use crate::config::OutputActivation;
use crate::error::SchemaError;
use crate::model::{KeepAction, PolicyOutput};
use crate::schema::{InputSchema, OUTPUT_NAMES};

/// Class labels for every head, `[batch]` each.
#[derive(Debug, Clone)]
pub struct ActionTargets<B: Backend> {
    pub source: Tensor<B, 1, Int>,
    pub target: Tensor<B, 1, Int>,
    pub soldiers: Tensor<B, 1, Int>,
    pub archers: Tensor<B, 1, Int>,
    widths: [usize; 4],
}

impl<B: Backend> ActionTargets<B> {
    /// Labels given as class indices per head, checked against the head
    /// widths of `schema`.
    pub fn from_indices(
        schema: &InputSchema,
        labels: [&[i64]; 4],
        device: &B::Device,
    ) -> Result<Self, SchemaError> {
        let batch = labels[0].len();
        if batch == 0 {
            return Err(SchemaError::EmptyBatch);
        }

        let widths = schema.head_widths();
        for ((head, values), width) in OUTPUT_NAMES.into_iter().zip(labels).zip(widths) {
            if values.len() != batch {
                return Err(SchemaError::BatchMismatch {
                    name: head,
                    expected: batch,
                    actual: values.len(),
                });
            }
            if let Some(&value) = values.iter().find(|&&v| v < 0 || v >= width as i64) {
                return Err(SchemaError::LabelOutOfRange { head, value, width });
            }
        }

        let [source, target, soldiers, archers] =
            labels.map(|values| Tensor::<B, 1, Int>::from_ints(values, device));
        Ok(Self {
            source,
            target,
            soldiers,
            archers,
            widths,
        })
    }

    /// Labels taken from decoded actions, one per batch row.
    pub fn from_actions(
        schema: &InputSchema,
        actions: &[KeepAction],
        device: &B::Device,
    ) -> Result<Self, SchemaError> {
        let source: Vec<i64> = actions.iter().map(|a| a.source as i64).collect();
        let target: Vec<i64> = actions.iter().map(|a| a.target as i64).collect();
        let soldiers: Vec<i64> = actions.iter().map(|a| a.soldiers.index() as i64).collect();
        let archers: Vec<i64> = actions.iter().map(|a| a.archers.index() as i64).collect();
        Self::from_indices(schema, [&source, &target, &soldiers, &archers], device)
    }

    pub fn batch_size(&self) -> usize {
        self.source.dims()[0]
    }

    /// Dense one-hot targets, `[batch, width]` per head.
    pub fn one_hot(&self) -> [Tensor<B, 2>; 4] {
        let [source, target, soldiers, archers] = self.widths;
        [
            one_hot(self.source.clone(), source),
            one_hot(self.target.clone(), target),
            one_hot(self.soldiers.clone(), soldiers),
            one_hot(self.archers.clone(), archers),
        ]
    }
}

fn one_hot<B: Backend>(labels: Tensor<B, 1, Int>, width: usize) -> Tensor<B, 2> {
    let [batch] = labels.dims();
    let device = labels.device();
    Tensor::zeros([batch, width], &device).scatter(
        1,
        labels.reshape([batch, 1]),
        Tensor::ones([batch, 1], &device),
    )
}

/// Sum over heads of the batch-mean cross-entropy. The heads are not
/// weighted, so the two location heads carry most of the loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiHeadLoss {
    activation: OutputActivation,
    epsilon: f32,
}

impl MultiHeadLoss {
    /// Probability floor for softmax outputs, keeps `log` finite.
    pub const EPSILON: f32 = 1e-7;

    pub fn new(activation: OutputActivation) -> Self {
        Self {
            activation,
            epsilon: Self::EPSILON,
        }
    }

    pub fn activation(&self) -> OutputActivation {
        self.activation
    }

    /// Cross-entropy of each head, in head order, `[1]` each.
    pub fn per_head<B: Backend>(
        &self,
        output: &PolicyOutput<B>,
        targets: &ActionTargets<B>,
    ) -> [Tensor<B, 1>; 4] {
        let [source, target, soldiers, archers] = targets.one_hot();
        [
            self.cross_entropy(output.source.clone(), source),
            self.cross_entropy(output.target.clone(), target),
            self.cross_entropy(output.soldiers.clone(), soldiers),
            self.cross_entropy(output.archers.clone(), archers),
        ]
    }

    /// The scalar training objective.
    pub fn forward<B: Backend>(
        &self,
        output: &PolicyOutput<B>,
        targets: &ActionTargets<B>,
    ) -> Tensor<B, 1> {
        let [source, target, soldiers, archers] = self.per_head(output, targets);
        source + target + soldiers + archers
    }

    fn cross_entropy<B: Backend>(&self, predicted: Tensor<B, 2>, one_hot: Tensor<B, 2>) -> Tensor<B, 1> {
        let log_probs = match self.activation {
            OutputActivation::Softmax => predicted.clamp(self.epsilon, 1.0 - self.epsilon).log(),
            OutputActivation::Raw => log_softmax(predicted, 1),
        };
        (one_hot * log_probs).sum_dim(1).mean().neg()
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::config::PolicyConfig;
    use crate::model::CommitLevel;

    type B = NdArray;

    fn schema() -> InputSchema {
        InputSchema::from_config(&PolicyConfig::new([12, 12, 1], 3)).unwrap()
    }

    fn action() -> KeepAction {
        KeepAction {
            source: 0,
            target: 2,
            soldiers: CommitLevel::Half,
            archers: CommitLevel::None,
        }
    }

    fn prediction(rows: [[f32; 3]; 2], levels: [[f32; 4]; 2]) -> PolicyOutput<B> {
        let device = Default::default();
        PolicyOutput {
            source: Tensor::from_floats([rows[0]], &device),
            target: Tensor::from_floats([rows[1]], &device),
            soldiers: Tensor::from_floats([levels[0]], &device),
            archers: Tensor::from_floats([levels[1]], &device),
        }
    }

    fn scalar(loss: Tensor<B, 1>) -> f32 {
        loss.into_scalar()
    }

    #[test]
    fn test_one_hot_targets() {
        let device = Default::default();
        let targets = ActionTargets::<B>::from_actions(&schema(), &[action()], &device).unwrap();
        let [source, target, soldiers, archers] = targets.one_hot();

        assert_eq!(source.into_data().to_vec::<f32>().unwrap(), vec![1.0, 0.0, 0.0]);
        assert_eq!(target.into_data().to_vec::<f32>().unwrap(), vec![0.0, 0.0, 1.0]);
        assert_eq!(soldiers.into_data().to_vec::<f32>().unwrap(), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(archers.into_data().to_vec::<f32>().unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_exact_prediction_is_near_zero() {
        let device = Default::default();
        let targets = ActionTargets::<B>::from_actions(&schema(), &[action()], &device).unwrap();
        let exact = prediction(
            [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            [[0.0, 0.0, 1.0, 0.0], [1.0, 0.0, 0.0, 0.0]],
        );

        let loss = scalar(MultiHeadLoss::new(OutputActivation::Softmax).forward(&exact, &targets));
        assert!(loss >= 0.0);
        assert!(loss < 1e-5, "loss was {loss}");
    }

    #[test]
    fn test_wrong_prediction_is_strictly_larger() {
        let device = Default::default();
        let targets = ActionTargets::<B>::from_actions(&schema(), &[action()], &device).unwrap();
        let objective = MultiHeadLoss::new(OutputActivation::Softmax);

        let exact = prediction(
            [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            [[0.0, 0.0, 1.0, 0.0], [1.0, 0.0, 0.0, 0.0]],
        );
        let wrong = prediction(
            [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
            [[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
        );

        let exact = scalar(objective.forward(&exact, &targets));
        let wrong = scalar(objective.forward(&wrong, &targets));
        assert!(wrong > exact);
        // each head contributes -ln(1e-7)
        assert!((wrong - 4.0 * 16.118).abs() < 0.1, "loss was {wrong}");
    }

    #[test]
    fn test_per_head_terms_sum_to_total() {
        let device = Default::default();
        let targets = ActionTargets::<B>::from_actions(&schema(), &[action()], &device).unwrap();
        let uniform = prediction([[1.0 / 3.0; 3]; 2], [[0.25; 4]; 2]);
        let objective = MultiHeadLoss::new(OutputActivation::Softmax);

        let terms: Vec<f32> = objective
            .per_head(&uniform, &targets)
            .into_iter()
            .map(scalar)
            .collect();
        assert!((terms[0] - 3.0f32.ln()).abs() < 1e-5);
        assert!((terms[2] - 4.0f32.ln()).abs() < 1e-5);

        let total = scalar(objective.forward(&uniform, &targets));
        assert!((total - terms.iter().sum::<f32>()).abs() < 1e-5);
    }

    #[test]
    fn test_raw_scores_use_log_softmax() {
        let device = Default::default();
        let targets = ActionTargets::<B>::from_actions(&schema(), &[action()], &device).unwrap();
        let objective = MultiHeadLoss::new(OutputActivation::Raw);

        let confident = prediction(
            [[30.0, 0.0, 0.0], [0.0, 0.0, 30.0]],
            [[0.0, 0.0, 30.0, 0.0], [30.0, 0.0, 0.0, 0.0]],
        );
        let flat = prediction([[0.0; 3]; 2], [[0.0; 4]; 2]);

        let confident = scalar(objective.forward(&confident, &targets));
        let flat = scalar(objective.forward(&flat, &targets));
        assert!(confident < 1e-5);
        assert!((flat - (2.0 * 3.0f32.ln() + 2.0 * 4.0f32.ln())).abs() < 1e-4);
    }

    #[test]
    fn test_labels_are_range_checked() {
        let device = Default::default();
        let err = ActionTargets::<B>::from_indices(&schema(), [&[3], &[0], &[0], &[0]], &device)
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::LabelOutOfRange {
                head: "source_keep",
                value: 3,
                width: 3
            }
        ));

        let err = ActionTargets::<B>::from_indices(&schema(), [&[0], &[0, 1], &[0], &[0]], &device)
            .unwrap_err();
        assert!(matches!(err, SchemaError::BatchMismatch { .. }));
    }
}
