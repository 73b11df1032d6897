//! Named, typed, shaped inputs of the keep policy.
//!
//! The names below are the binding contract with the game engine: the
//! frozen artifact exposes exactly these tensors, and the engine looks
//! them up by string match.

use std::fmt;

use burn::prelude::*;
use burn::tensor::{ElementConversion, TensorData};

use crate::config::PolicyConfig;
use crate::error::{ConfigError, SchemaError};

pub const MAP_INPUT: &str = "map_input";
pub const KEEP_OWNERSHIP: &str = "keep_ownership";
pub const SOLDIER_COUNTS: &str = "soldier_counts";
pub const ARCHER_COUNTS: &str = "archer_counts";

pub const SOURCE_KEEP: &str = "source_keep";
pub const TARGET_KEEP: &str = "target_keep";
pub const SOLDIER_PERCENT: &str = "soldier_percent";
pub const ARCHER_PERCENT: &str = "archer_percent";

/// Output names in head order.
pub const OUTPUT_NAMES: [&str; 4] = [SOURCE_KEEP, TARGET_KEEP, SOLDIER_PERCENT, ARCHER_PERCENT];

/// Quantized commitment levels per unit type (0/25/50/75 percent).
pub const COMMIT_LEVELS: usize = 4;

/// Element type of a declared tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "float32"),
            Self::I32 => write!(f, "int32"),
        }
    }
}

/// A declared input tensor. Axis 0 is the batch axis and is the only axis
/// allowed to stay unbound (`None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Option<usize>>,
}

impl TensorSpec {
    /// Spec with a dynamic batch axis followed by `dims`.
    pub fn batched(name: &str, dtype: DType, dims: &[usize]) -> Self {
        let mut shape = Vec::with_capacity(dims.len() + 1);
        shape.push(None);
        shape.extend(dims.iter().copied().map(Some));
        Self {
            name: name.to_string(),
            dtype,
            shape,
        }
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (axis, dim) in self.shape.iter().enumerate() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            match dim {
                Some(n) => write!(f, "{n}")?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

/// Input slots of one compiled model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSchema {
    pub map_shape: [usize; 3],
    pub n_keeps: usize,
    pub n_players: Option<usize>,
}

impl InputSchema {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            map_shape: config.input_shape,
            n_keeps: config.n_keeps,
            n_players: config.n_players,
        })
    }

    pub fn has_ownership(&self) -> bool {
        self.n_players.is_some()
    }

    /// Declared inputs in binding order. The ownership slot only exists when
    /// the configuration embeds player identity.
    pub fn signature(&self) -> Vec<TensorSpec> {
        let mut specs = vec![TensorSpec::batched(MAP_INPUT, DType::F32, &self.map_shape)];
        if self.has_ownership() {
            specs.push(TensorSpec::batched(KEEP_OWNERSHIP, DType::I32, &[self.n_keeps]));
        }
        specs.push(TensorSpec::batched(SOLDIER_COUNTS, DType::F32, &[self.n_keeps]));
        specs.push(TensorSpec::batched(ARCHER_COUNTS, DType::F32, &[self.n_keeps]));
        specs
    }

    pub fn input_names(&self) -> Vec<&'static str> {
        if self.has_ownership() {
            vec![MAP_INPUT, KEEP_OWNERSHIP, SOLDIER_COUNTS, ARCHER_COUNTS]
        } else {
            vec![MAP_INPUT, SOLDIER_COUNTS, ARCHER_COUNTS]
        }
    }

    /// Widths of the four output heads, in head order.
    pub fn head_widths(&self) -> [usize; 4] {
        [self.n_keeps, self.n_keeps, COMMIT_LEVELS, COMMIT_LEVELS]
    }

    /// Number of values in one flattened map.
    pub fn map_len(&self) -> usize {
        self.map_shape.iter().product()
    }
}

impl PolicyConfig {
    /// Validated input slots of the model this config builds.
    pub fn input_schema(&self) -> Result<InputSchema, ConfigError> {
        InputSchema::from_config(self)
    }
}

/// One game state as the engine reports it, before batching.
#[derive(Debug, Clone, PartialEq)]
pub struct GameSnapshot {
    /// Row-major (height, width, channels) map cells.
    pub map: Vec<f32>,
    /// Owner id per keep; `n_players` marks an unowned keep.
    pub ownership: Vec<u32>,
    pub soldiers: Vec<f32>,
    pub archers: Vec<f32>,
}

/// Batched model inputs that passed schema validation.
///
/// The tensors are only reachable through accessors so a value of this
/// type always matches the schema it was built against.
#[derive(Debug, Clone)]
pub struct PolicyInputs<B: Backend> {
    schema: InputSchema,
    /// [batch, height, width, channels]
    map: Tensor<B, 4>,
    /// [batch, n_keeps]
    ownership: Option<Tensor<B, 2, Int>>,
    /// [batch, n_keeps]
    soldiers: Tensor<B, 2>,
    /// [batch, n_keeps]
    archers: Tensor<B, 2>,
}

/// The tensors of a [`PolicyInputs`], in binding order.
pub type InputTensors<B> = (
    Tensor<B, 4>,
    Option<Tensor<B, 2, Int>>,
    Tensor<B, 2>,
    Tensor<B, 2>,
);

impl<B: Backend> PolicyInputs<B> {
    /// Validates shapes, ownership ids and unit counts against `schema`.
    pub fn new(
        schema: &InputSchema,
        map: Tensor<B, 4>,
        ownership: Option<Tensor<B, 2, Int>>,
        soldiers: Tensor<B, 2>,
        archers: Tensor<B, 2>,
    ) -> Result<Self, SchemaError> {
        let batch = map.dims()[0];
        if batch == 0 {
            return Err(SchemaError::EmptyBatch);
        }

        let [h, w, c] = schema.map_shape;
        check_shape(MAP_INPUT, &map.dims(), &[batch, h, w, c])?;
        check_shape(SOLDIER_COUNTS, &soldiers.dims(), &[batch, schema.n_keeps])?;
        check_shape(ARCHER_COUNTS, &archers.dims(), &[batch, schema.n_keeps])?;

        match (schema.n_players, &ownership) {
            (Some(n_players), Some(ids)) => {
                check_shape(KEEP_OWNERSHIP, &ids.dims(), &[batch, schema.n_keeps])?;
                let min = ids.clone().min().into_scalar().elem::<i64>();
                let max = ids.clone().max().into_scalar().elem::<i64>();
                for value in [min, max] {
                    if value < 0 || value > n_players as i64 {
                        return Err(SchemaError::OwnershipOutOfRange {
                            value,
                            max: n_players,
                        });
                    }
                }
            }
            (Some(_), None) => return Err(SchemaError::MissingOwnership),
            (None, Some(_)) => return Err(SchemaError::UnexpectedOwnership),
            (None, None) => {}
        }

        check_count_rows(SOLDIER_COUNTS, &soldiers)?;
        check_count_rows(ARCHER_COUNTS, &archers)?;

        Ok(Self {
            schema: schema.clone(),
            map,
            ownership,
            soldiers,
            archers,
        })
    }

    /// Checks these inputs against another schema, e.g. the one of the
    /// model they are about to be fed to.
    pub fn revalidate(self, schema: &InputSchema) -> Result<Self, SchemaError> {
        if &self.schema == schema {
            return Ok(self);
        }
        Self::new(schema, self.map, self.ownership, self.soldiers, self.archers)
    }

    /// Encodes a batch of snapshots. The ownership vector of each snapshot
    /// is ignored when the schema has no ownership slot.
    pub fn from_snapshots(
        schema: &InputSchema,
        snapshots: &[GameSnapshot],
        device: &B::Device,
    ) -> Result<Self, SchemaError> {
        if snapshots.is_empty() {
            return Err(SchemaError::EmptyBatch);
        }
        let batch = snapshots.len();
        let keeps = schema.n_keeps;

        let mut map = Vec::with_capacity(batch * schema.map_len());
        let mut ownership = Vec::with_capacity(batch * keeps);
        let mut soldiers = Vec::with_capacity(batch * keeps);
        let mut archers = Vec::with_capacity(batch * keeps);

        for (index, snapshot) in snapshots.iter().enumerate() {
            check_len(index, MAP_INPUT, snapshot.map.len(), schema.map_len())?;
            check_len(index, SOLDIER_COUNTS, snapshot.soldiers.len(), keeps)?;
            check_len(index, ARCHER_COUNTS, snapshot.archers.len(), keeps)?;

            if schema.has_ownership() {
                check_len(index, KEEP_OWNERSHIP, snapshot.ownership.len(), keeps)?;
                ownership.extend(snapshot.ownership.iter().map(|&id| id as i64));
            }
            map.extend_from_slice(&snapshot.map);
            soldiers.extend_from_slice(&snapshot.soldiers);
            archers.extend_from_slice(&snapshot.archers);
        }

        let [h, w, c] = schema.map_shape;
        let map = Tensor::<B, 4>::from_data(TensorData::new(map, [batch, h, w, c]), device);
        let ownership = schema.has_ownership().then(|| {
            Tensor::<B, 2, Int>::from_data(TensorData::new(ownership, [batch, keeps]), device)
        });
        let soldiers = Tensor::<B, 2>::from_data(TensorData::new(soldiers, [batch, keeps]), device);
        let archers = Tensor::<B, 2>::from_data(TensorData::new(archers, [batch, keeps]), device);

        Self::new(schema, map, ownership, soldiers, archers)
    }

    pub fn batch_size(&self) -> usize {
        self.map.dims()[0]
    }

    /// Schema these inputs were validated against.
    pub fn schema(&self) -> &InputSchema {
        &self.schema
    }

    pub fn map(&self) -> &Tensor<B, 4> {
        &self.map
    }

    pub fn ownership(&self) -> Option<&Tensor<B, 2, Int>> {
        self.ownership.as_ref()
    }

    pub fn soldiers(&self) -> &Tensor<B, 2> {
        &self.soldiers
    }

    pub fn archers(&self) -> &Tensor<B, 2> {
        &self.archers
    }

    pub fn into_tensors(self) -> InputTensors<B> {
        (self.map, self.ownership, self.soldiers, self.archers)
    }
}

fn check_shape(name: &'static str, actual: &[usize], expected: &[usize]) -> Result<(), SchemaError> {
    if actual.first() != expected.first() {
        return Err(SchemaError::BatchMismatch {
            name,
            expected: expected[0],
            actual: actual.first().copied().unwrap_or(0),
        });
    }
    if actual != expected {
        return Err(SchemaError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

fn check_len(index: usize, name: &'static str, actual: usize, expected: usize) -> Result<(), SchemaError> {
    if actual != expected {
        return Err(SchemaError::SnapshotLength {
            index,
            name,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Rejects the first batch row holding a negative count.
fn check_count_rows<B: Backend>(name: &'static str, counts: &Tensor<B, 2>) -> Result<(), SchemaError> {
    let row_min = counts.clone().min_dim(1).into_data();
    match row_min.iter::<f32>().position(|c| c < 0.0) {
        Some(index) => Err(SchemaError::NegativeCount { index, name }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type B = NdArray;

    fn schema() -> InputSchema {
        InputSchema::from_config(&PolicyConfig::new([12, 12, 1], 6).with_n_players(Some(3))).unwrap()
    }

    fn snapshot(owner: u32) -> GameSnapshot {
        GameSnapshot {
            map: vec![0.5; 144],
            ownership: vec![owner; 6],
            soldiers: vec![10.0; 6],
            archers: vec![2.0; 6],
        }
    }

    #[test]
    fn test_signature_fine_grained() {
        let specs = schema().signature();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![MAP_INPUT, KEEP_OWNERSHIP, SOLDIER_COUNTS, ARCHER_COUNTS]);
        assert_eq!(specs[0].shape, vec![None, Some(12), Some(12), Some(1)]);
        assert_eq!(specs[1].dtype, DType::I32);
        assert_eq!(specs[2].shape, vec![None, Some(6)]);
        assert_eq!(specs[0].to_string(), "float32[?, 12, 12, 1]");
    }

    #[test]
    fn test_signature_coarse_has_three_inputs() {
        let schema = PolicyConfig::coarse().input_schema().unwrap();
        let names: Vec<String> = schema.signature().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec![MAP_INPUT, SOLDIER_COUNTS, ARCHER_COUNTS]);
        assert_eq!(schema.head_widths(), [64, 64, 4, 4]);
    }

    #[test]
    fn test_from_snapshots_accepts_unowned_sentinel() {
        let device = Default::default();
        let inputs = PolicyInputs::<B>::from_snapshots(&schema(), &[snapshot(3), snapshot(0)], &device)
            .unwrap();
        assert_eq!(inputs.batch_size(), 2);
        assert_eq!(inputs.map().dims(), [2, 12, 12, 1]);
        assert_eq!(inputs.ownership().unwrap().dims(), [2, 6]);
    }

    #[test]
    fn test_from_snapshots_rejects_out_of_range_owner() {
        let device = Default::default();
        let err = PolicyInputs::<B>::from_snapshots(&schema(), &[snapshot(4)], &device).unwrap_err();
        assert!(matches!(err, SchemaError::OwnershipOutOfRange { value: 4, max: 3 }));
    }

    #[test]
    fn test_from_snapshots_rejects_bad_lengths() {
        let device = Default::default();
        let mut short = snapshot(0);
        short.soldiers.pop();
        let err = PolicyInputs::<B>::from_snapshots(&schema(), &[short], &device).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::SnapshotLength {
                name: SOLDIER_COUNTS,
                expected: 6,
                actual: 5,
                ..
            }
        ));

        let mut negative = snapshot(0);
        negative.archers[0] = -1.0;
        let err = PolicyInputs::<B>::from_snapshots(&schema(), &[negative], &device).unwrap_err();
        assert!(matches!(err, SchemaError::NegativeCount { .. }));

        let err = PolicyInputs::<B>::from_snapshots(&schema(), &[], &device).unwrap_err();
        assert!(matches!(err, SchemaError::EmptyBatch));
    }

    #[test]
    fn test_new_rejects_shape_mismatch() {
        let device = Default::default();
        let schema = schema();
        let map = Tensor::<B, 4>::zeros([1, 10, 12, 1], &device);
        let ids = Tensor::<B, 2, Int>::zeros([1, 6], &device);
        let counts = Tensor::<B, 2>::zeros([1, 6], &device);

        let err = PolicyInputs::new(&schema, map, Some(ids), counts.clone(), counts).unwrap_err();
        assert!(matches!(err, SchemaError::ShapeMismatch { name: MAP_INPUT, .. }));
    }

    #[test]
    fn test_new_checks_ownership_presence() {
        let device = Default::default();
        let map = Tensor::<B, 4>::zeros([1, 12, 12, 1], &device);
        let counts = Tensor::<B, 2>::zeros([1, 6], &device);

        let err = PolicyInputs::new(&schema(), map.clone(), None, counts.clone(), counts.clone())
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingOwnership));

        let coarse = InputSchema::from_config(&PolicyConfig::new([12, 12, 1], 6)).unwrap();
        let ids = Tensor::<B, 2, Int>::zeros([1, 6], &device);
        let err = PolicyInputs::new(&coarse, map, Some(ids), counts.clone(), counts).unwrap_err();
        assert!(matches!(err, SchemaError::UnexpectedOwnership));
    }

    #[test]
    fn test_new_rejects_batch_mismatch() {
        let device = Default::default();
        let map = Tensor::<B, 4>::zeros([2, 12, 12, 1], &device);
        let ids = Tensor::<B, 2, Int>::zeros([2, 6], &device);
        let soldiers = Tensor::<B, 2>::zeros([1, 6], &device);
        let archers = Tensor::<B, 2>::zeros([2, 6], &device);

        let err = PolicyInputs::new(&schema(), map, Some(ids), soldiers, archers).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::BatchMismatch {
                name: SOLDIER_COUNTS,
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_new_rejects_negative_counts() {
        let device = Default::default();
        let map = Tensor::<B, 4>::zeros([2, 12, 12, 1], &device);
        let ids = Tensor::<B, 2, Int>::zeros([2, 6], &device);
        let soldiers = Tensor::<B, 2>::ones([2, 6], &device);
        let archers = Tensor::<B, 2>::from_floats(
            [[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], [0.0, 0.0, -2.0, 0.0, 0.0, 0.0]],
            &device,
        );

        let err = PolicyInputs::new(&schema(), map, Some(ids), soldiers, archers).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::NegativeCount {
                index: 1,
                name: ARCHER_COUNTS
            }
        ));
    }

    #[test]
    fn test_revalidate_against_other_schema() {
        let device = Default::default();
        let inputs = PolicyInputs::<B>::from_snapshots(&schema(), &[snapshot(0)], &device).unwrap();
        let same = inputs.clone().revalidate(&schema()).unwrap();
        assert_eq!(same.schema(), &schema());

        let coarse = InputSchema::from_config(&PolicyConfig::new([12, 12, 1], 6)).unwrap();
        let err = inputs.revalidate(&coarse).unwrap_err();
        assert!(matches!(err, SchemaError::UnexpectedOwnership));
    }
}
