//! Policy hyper-parameters and export settings.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment keys read by [`ExportSettings::from_env`].
pub const ENV_VARIANT: &str = "KEEPLORD_VARIANT";
pub const ENV_CONFIG: &str = "KEEPLORD_CONFIG";
pub const ENV_MAP_SIZE: &str = "KEEPLORD_MAP_SIZE";
pub const ENV_KEEPS: &str = "KEEPLORD_KEEPS";
pub const ENV_PLAYERS: &str = "KEEPLORD_PLAYERS";
pub const ENV_ACTIVATION: &str = "KEEPLORD_ACTIVATION";
pub const ENV_CHECKPOINT: &str = "KEEPLORD_CHECKPOINT";
pub const ENV_OUTPUT_DIR: &str = "KEEPLORD_OUTPUT_DIR";
pub const ENV_ARTIFACT: &str = "KEEPLORD_ARTIFACT";

pub const DEFAULT_OUTPUT_DIR: &str = "AI";
pub const DEFAULT_ARTIFACT: &str = "model.onnx";

/// How each output head turns its linear projection into the exported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    /// Normalized distributions (softmax over the head's categories).
    Softmax,
    /// Unnormalized scores straight from the projection.
    Raw,
}

impl FromStr for OutputActivation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "softmax" => Ok(Self::Softmax),
            "raw" => Ok(Self::Raw),
            other => Err(format!("expected `softmax` or `raw`, got `{other}`")),
        }
    }
}

impl fmt::Display for OutputActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Softmax => write!(f, "softmax"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// The two deployed architectures of the keep policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// 32 keeps, 20 players, learned ownership embedding.
    FineGrained,
    /// 64 keeps, no ownership input.
    Coarse,
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fine" | "fine_grained" | "fine-grained" => Ok(Self::FineGrained),
            "coarse" => Ok(Self::Coarse),
            other => Err(format!("expected `fine` or `coarse`, got `{other}`")),
        }
    }
}

/// Architecture of the keep policy network.
///
/// `n_players` doubles as the capability flag for the ownership embedding:
/// when it is `None` the network has no ownership input at all.
#[derive(Debug, Config)]
pub struct PolicyConfig {
    /// Map grid as (height, width, channels).
    pub input_shape: [usize; 3],
    /// Number of controllable locations.
    pub n_keeps: usize,
    /// Player-identity cardinality; id `n_players` marks an unowned keep.
    pub n_players: Option<usize>,
    #[config(default = "OutputActivation::Softmax")]
    pub output_activation: OutputActivation,
    /// Channel depth of the two convolution stages.
    #[config(default = "[32, 64]")]
    pub conv_channels: [usize; 2],
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 2)]
    pub pool_size: usize,
    #[config(default = 8)]
    pub embedding_width: usize,
    #[config(default = 64)]
    pub keep_summary_width: usize,
    /// Widths of the shared dense trunk.
    #[config(default = "[256, 128]")]
    pub trunk_widths: [usize; 2],
}

impl PolicyConfig {
    /// 256x256 map, 32 keeps, 20 players.
    pub fn fine_grained() -> Self {
        Self::new([256, 256, 1], 32).with_n_players(Some(20))
    }

    /// 256x256 map, 64 keeps, no ownership embedding.
    pub fn coarse() -> Self {
        Self::new([256, 256, 1], 64)
    }

    pub fn for_variant(variant: Variant) -> Self {
        match variant {
            Variant::FineGrained => Self::fine_grained(),
            Variant::Coarse => Self::coarse(),
        }
    }

    pub fn has_ownership_embedding(&self) -> bool {
        self.n_players.is_some()
    }

    /// Checks every dimension before any module is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let [height, width, channels] = self.input_shape;
        if height == 0 || width == 0 || channels == 0 {
            return Err(ConfigError::EmptyMap {
                height,
                width,
                channels,
            });
        }
        if self.n_keeps == 0 {
            return Err(ConfigError::NoKeeps);
        }
        if self.n_players == Some(0) {
            return Err(ConfigError::NoPlayers);
        }

        let widths = [
            ("conv_channels[0]", self.conv_channels[0]),
            ("conv_channels[1]", self.conv_channels[1]),
            ("kernel_size", self.kernel_size),
            ("pool_size", self.pool_size),
            ("embedding_width", self.embedding_width),
            ("keep_summary_width", self.keep_summary_width),
            ("trunk_widths[0]", self.trunk_widths[0]),
            ("trunk_widths[1]", self.trunk_widths[1]),
        ];
        if let Some((name, _)) = widths.iter().find(|(_, w)| *w == 0) {
            return Err(ConfigError::ZeroWidth(name));
        }

        if self.spatial_grid().is_none() {
            return Err(ConfigError::MapTooSmall { height, width });
        }

        Ok(())
    }

    /// Height and width of the feature map after both conv/pool stages.
    pub fn spatial_grid(&self) -> Option<[usize; 2]> {
        let [height, width, _] = self.input_shape;
        Some([self.stage_output(height)?, self.stage_output(width)?])
    }

    fn stage_output(&self, mut extent: usize) -> Option<usize> {
        if self.kernel_size == 0 || self.pool_size == 0 {
            return None;
        }
        for _ in 0..2 {
            // valid convolution, then non-overlapping pooling
            extent = extent.checked_sub(self.kernel_size - 1)?;
            extent /= self.pool_size;
            if extent == 0 {
                return None;
            }
        }
        Some(extent)
    }

    /// True when both configs build the same parameter shapes. The output
    /// activation carries no parameters and is not compared.
    pub fn same_topology(&self, other: &Self) -> bool {
        self.input_shape == other.input_shape
            && self.n_keeps == other.n_keeps
            && self.n_players == other.n_players
            && self.conv_channels == other.conv_channels
            && self.kernel_size == other.kernel_size
            && self.pool_size == other.pool_size
            && self.embedding_width == other.embedding_width
            && self.keep_summary_width == other.keep_summary_width
            && self.trunk_widths == other.trunk_widths
    }

    /// Length of the flattened spatial feature vector.
    pub fn spatial_features(&self) -> usize {
        self.spatial_grid()
            .map(|[h, w]| self.conv_channels[1] * h * w)
            .unwrap_or(0)
    }

    /// Length of the per-keep vector fed to the keep summary layer.
    pub fn keep_features(&self) -> usize {
        let ownership = if self.has_ownership_embedding() {
            self.n_keeps * self.embedding_width
        } else {
            0
        };
        ownership + 2 * self.n_keeps
    }
}

/// Everything the export binary needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub policy: PolicyConfig,
    /// Trained weights to load before freezing; fresh weights when absent.
    pub checkpoint: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub artifact_name: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::fine_grained(),
            checkpoint: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            artifact_name: DEFAULT_ARTIFACT.to_string(),
        }
    }
}

impl ExportSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves settings through `lookup`, applying overrides on top of the
    /// selected variant preset (or a saved config file).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let variant = parse_var::<Variant, _>(&lookup, ENV_VARIANT)?.unwrap_or(Variant::FineGrained);

        let mut policy = match lookup(ENV_CONFIG) {
            Some(path) => PolicyConfig::load(&path).map_err(|e| ConfigError::Load {
                path: PathBuf::from(&path),
                reason: e.to_string(),
            })?,
            None => PolicyConfig::for_variant(variant),
        };

        if let Some(size) = parse_var::<usize, _>(&lookup, ENV_MAP_SIZE)? {
            policy.input_shape = [size, size, policy.input_shape[2]];
        }
        if let Some(keeps) = parse_var::<usize, _>(&lookup, ENV_KEEPS)? {
            policy.n_keeps = keeps;
        }
        if let Some(players) = parse_var::<usize, _>(&lookup, ENV_PLAYERS)? {
            policy.n_players = Some(players);
        }
        if let Some(activation) = parse_var::<OutputActivation, _>(&lookup, ENV_ACTIVATION)? {
            policy.output_activation = activation;
        }
        policy.validate()?;

        Ok(Self {
            policy,
            checkpoint: lookup(ENV_CHECKPOINT).map(PathBuf::from),
            output_dir: lookup(ENV_OUTPUT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            artifact_name: lookup(ENV_ARTIFACT).unwrap_or_else(|| DEFAULT_ARTIFACT.to_string()),
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidSetting {
                key,
                reason: e.to_string(),
                value,
            }),
    }
}
