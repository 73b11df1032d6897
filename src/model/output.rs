//! Head outputs and their decoding into game actions.

use std::fmt;

use burn::prelude::*;

use crate::schema::COMMIT_LEVELS;

/// Share of a keep's units committed to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommitLevel {
    #[default]
    None,
    Quarter,
    Half,
    ThreeQuarters,
}

impl CommitLevel {
    pub const ALL: [CommitLevel; COMMIT_LEVELS] =
        [Self::None, Self::Quarter, Self::Half, Self::ThreeQuarters];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn percent(self) -> u32 {
        self.index() as u32 * 25
    }

    /// Units sent out of `available`, rounded down.
    pub fn apply(self, available: u32) -> u32 {
        // at most 75% of `available`, so the quotient fits back into u32
        (u64::from(available) * u64::from(self.percent()) / 100) as u32
    }
}

impl fmt::Display for CommitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent())
    }
}

/// One decoded move: send a share of soldiers and archers from `source`
/// to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeepAction {
    pub source: usize,
    pub target: usize,
    pub soldiers: CommitLevel,
    pub archers: CommitLevel,
}

/// The four heads, each `[batch, width]`.
#[derive(Debug, Clone)]
pub struct PolicyOutput<B: Backend> {
    pub source: Tensor<B, 2>,
    pub target: Tensor<B, 2>,
    pub soldiers: Tensor<B, 2>,
    pub archers: Tensor<B, 2>,
}

impl<B: Backend> PolicyOutput<B> {
    /// Last-axis sizes in head order.
    pub fn head_widths(&self) -> [usize; 4] {
        [
            self.source.dims()[1],
            self.target.dims()[1],
            self.soldiers.dims()[1],
            self.archers.dims()[1],
        ]
    }

    pub fn batch_size(&self) -> usize {
        self.source.dims()[0]
    }

    /// Arg-max of every head, one action per batch row. Works the same on
    /// probabilities and raw scores.
    pub fn greedy(&self) -> Vec<KeepAction> {
        let source = argmax(&self.source);
        let target = argmax(&self.target);
        let soldiers = argmax(&self.soldiers);
        let archers = argmax(&self.archers);

        (0..self.batch_size())
            .map(|row| KeepAction {
                source: source[row],
                target: target[row],
                soldiers: CommitLevel::from_index(soldiers[row]).unwrap_or_default(),
                archers: CommitLevel::from_index(archers[row]).unwrap_or_default(),
            })
            .collect()
    }
}

fn argmax<B: Backend>(head: &Tensor<B, 2>) -> Vec<usize> {
    head.clone()
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .map(|i| i.max(0) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type B = NdArray;

    #[test]
    fn test_commit_levels() {
        assert_eq!(CommitLevel::from_index(2), Some(CommitLevel::Half));
        assert_eq!(CommitLevel::from_index(4), None);
        assert_eq!(CommitLevel::ThreeQuarters.percent(), 75);
        assert_eq!(CommitLevel::Quarter.apply(10), 2);
        assert_eq!(CommitLevel::None.apply(10), 0);
        assert_eq!(CommitLevel::Half.to_string(), "50%");
    }

    #[test]
    fn test_commit_on_large_garrison() {
        assert_eq!(CommitLevel::ThreeQuarters.apply(u32::MAX), 3_221_225_471);
        assert_eq!(CommitLevel::Half.apply(100_000_000), 50_000_000);
        assert_eq!(CommitLevel::None.apply(u32::MAX), 0);
    }

    #[test]
    fn test_greedy_decodes_each_row() {
        let device = Default::default();
        let output = PolicyOutput::<B> {
            source: Tensor::from_floats([[0.1, 0.7, 0.2], [0.6, 0.3, 0.1]], &device),
            target: Tensor::from_floats([[0.0, 0.0, 1.0], [0.2, 0.5, 0.3]], &device),
            soldiers: Tensor::from_floats([[0.1, 0.2, 0.3, 0.4], [0.9, 0.0, 0.1, 0.0]], &device),
            archers: Tensor::from_floats([[0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 0.8, 0.2]], &device),
        };
        assert_eq!(output.head_widths(), [3, 3, 4, 4]);

        let actions = output.greedy();
        assert_eq!(
            actions,
            vec![
                KeepAction {
                    source: 1,
                    target: 2,
                    soldiers: CommitLevel::ThreeQuarters,
                    archers: CommitLevel::Quarter,
                },
                KeepAction {
                    source: 0,
                    target: 1,
                    soldiers: CommitLevel::None,
                    archers: CommitLevel::Half,
                },
            ]
        );
    }
}
