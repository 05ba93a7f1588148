//! Configuration for post-hoc EMA tracking.
//!
//! # Defaults
//!
//! | Parameter | Default | Description |
//! |-----------|---------|-------------|
//! | `sigma_rels` | `[0.05, 0.28]` | Relative widths of the maintained profiles |
//! | `update_every` | 10 | Steps between average updates |
//! | `checkpoint_every` | 1000 | Steps between checkpoint cycles |
//! | `max_checkpoints` | 100 | Retained checkpoints per profile |
//! | `synthesis_precision` | `Fp16` | Element type of synthesized output |
//! | `offload_to_cpu` | false | Hold averaged state on the CPU |
//! | `ignore_names` | empty | Tensor names excluded by exact match |
//! | `ignore_startswith_names` | empty | Tensor names excluded by prefix match |
//! | `no_ema_names` | empty | Parameter or buffer names excluded from averaging |

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EmaError, Result};
use crate::profile::EmaProfile;

/// Floating-point precision for synthesized output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    /// 16-bit floating point (half precision).
    Fp16,

    /// 16-bit brain floating point.
    ///
    /// Same 8-bit exponent as `Fp32`, so it keeps the full dynamic range at
    /// reduced mantissa precision.
    Bf16,

    /// 32-bit floating point.
    Fp32,

    /// 64-bit floating point.
    Fp64,
}

impl Precision {
    /// Tensor element type for this precision.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::Fp32 => DType::F32,
            Self::Fp64 => DType::F64,
        }
    }

    /// Returns the number of bytes per value.
    #[must_use]
    pub const fn bytes_per_value(self) -> usize {
        match self {
            Self::Fp16 | Self::Bf16 => 2,
            Self::Fp32 => 4,
            Self::Fp64 => 8,
        }
    }

    /// Whether this precision is below single precision.
    #[must_use]
    pub const fn is_reduced(self) -> bool {
        matches!(self, Self::Fp16 | Self::Bf16)
    }
}

/// Main configuration for [`PostHocEma`](crate::PostHocEma).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostHocEmaConfig {
    /// Directory checkpoints are written to and read from.
    pub checkpoint_dir: PathBuf,

    /// Relative widths of the maintained basis profiles, in order.
    ///
    /// The position of a width in this list is the profile index used in
    /// checkpoint file names.
    #[serde(default = "default_sigma_rels")]
    pub sigma_rels: Vec<f64>,

    /// Number of update calls between actual average updates.
    #[serde(default = "default_update_every")]
    pub update_every: u64,

    /// Number of steps between checkpoint cycles.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,

    /// Maximum retained checkpoints per profile.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// Element type of synthesized output state.
    #[serde(default = "default_synthesis_precision")]
    pub synthesis_precision: Precision,

    /// Hold averaged state on the CPU regardless of the model's device.
    #[serde(default)]
    pub offload_to_cpu: bool,

    /// Tensor names excluded from averaging by exact match.
    ///
    /// Applied to every maintained profile.
    #[serde(default)]
    pub ignore_names: Vec<String>,

    /// Tensor names excluded from averaging by prefix match.
    #[serde(default)]
    pub ignore_startswith_names: Vec<String>,

    /// Parameter or buffer names excluded from averaging by exact match.
    #[serde(default)]
    pub no_ema_names: Vec<String>,
}

// Default value functions for serde
fn default_sigma_rels() -> Vec<f64> {
    vec![0.05, 0.28]
}
fn default_update_every() -> u64 {
    10
}
fn default_checkpoint_every() -> u64 {
    1000
}
fn default_max_checkpoints() -> usize {
    100
}
fn default_synthesis_precision() -> Precision {
    Precision::Fp16
}

impl Default for PostHocEmaConfig {
    fn default() -> Self {
        Self::new("posthoc-ema-checkpoints")
    }
}

impl PostHocEmaConfig {
    /// Create a configuration with defaults for everything but the
    /// checkpoint directory.
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            sigma_rels: default_sigma_rels(),
            update_every: default_update_every(),
            checkpoint_every: default_checkpoint_every(),
            max_checkpoints: default_max_checkpoints(),
            synthesis_precision: default_synthesis_precision(),
            offload_to_cpu: false,
            ignore_names: Vec::new(),
            ignore_startswith_names: Vec::new(),
            no_ema_names: Vec::new(),
        }
    }

    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder(checkpoint_dir: impl Into<PathBuf>) -> PostHocEmaConfigBuilder {
        PostHocEmaConfigBuilder {
            checkpoint_dir: checkpoint_dir.into(),
            ..PostHocEmaConfigBuilder::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(EmaError::config("checkpoint_dir must not be empty"));
        }
        if self.sigma_rels.is_empty() {
            return Err(EmaError::config("sigma_rels must not be empty"));
        }
        for &sigma_rel in &self.sigma_rels {
            crate::profile::sigma_rel_to_gamma(sigma_rel)?;
        }
        if self.update_every == 0 {
            return Err(EmaError::config("update_every must be at least 1"));
        }
        if self.checkpoint_every == 0 {
            return Err(EmaError::config("checkpoint_every must be at least 1"));
        }
        if self.max_checkpoints == 0 {
            return Err(EmaError::config("max_checkpoints must be at least 1"));
        }
        Ok(())
    }

    /// Profiles for the configured widths, in index order.
    pub fn profiles(&self) -> Result<Vec<EmaProfile>> {
        self.sigma_rels
            .iter()
            .map(|&sigma_rel| EmaProfile::from_sigma_rel(sigma_rel))
            .collect()
    }
}

/// Builder for [`PostHocEmaConfig`].
#[derive(Debug, Default)]
pub struct PostHocEmaConfigBuilder {
    checkpoint_dir: PathBuf,
    sigma_rels: Option<Vec<f64>>,
    update_every: Option<u64>,
    checkpoint_every: Option<u64>,
    max_checkpoints: Option<usize>,
    synthesis_precision: Option<Precision>,
    offload_to_cpu: Option<bool>,
    ignore_names: Vec<String>,
    ignore_startswith_names: Vec<String>,
    no_ema_names: Vec<String>,
}

impl PostHocEmaConfigBuilder {
    /// Sets the maintained profile widths.
    #[must_use]
    pub fn sigma_rels(mut self, sigma_rels: impl Into<Vec<f64>>) -> Self {
        self.sigma_rels = Some(sigma_rels.into());
        self
    }

    /// Sets the update cadence in steps.
    #[must_use]
    pub fn update_every(mut self, steps: u64) -> Self {
        self.update_every = Some(steps);
        self
    }

    /// Sets the checkpoint cadence in steps.
    #[must_use]
    pub fn checkpoint_every(mut self, steps: u64) -> Self {
        self.checkpoint_every = Some(steps);
        self
    }

    /// Sets the retained checkpoint bound per profile.
    #[must_use]
    pub fn max_checkpoints(mut self, count: usize) -> Self {
        self.max_checkpoints = Some(count);
        self
    }

    /// Sets the element type of synthesized output.
    #[must_use]
    pub fn synthesis_precision(mut self, precision: Precision) -> Self {
        self.synthesis_precision = Some(precision);
        self
    }

    /// Sets whether averaged state is held on the CPU.
    #[must_use]
    pub fn offload_to_cpu(mut self, offload: bool) -> Self {
        self.offload_to_cpu = Some(offload);
        self
    }

    /// Excludes tensors from averaging by exact name.
    #[must_use]
    pub fn ignore_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignore_names.extend(names);
        self
    }

    /// Excludes tensors whose name starts with any of the given prefixes.
    #[must_use]
    pub fn ignore_startswith_names(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.ignore_startswith_names.extend(prefixes);
        self
    }

    /// Excludes parameters or buffers from averaging by exact name.
    #[must_use]
    pub fn no_ema_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.no_ema_names.extend(names);
        self
    }

    /// Builds the configuration with defaults for unset values.
    pub fn build(self) -> PostHocEmaConfig {
        PostHocEmaConfig {
            checkpoint_dir: self.checkpoint_dir,
            sigma_rels: self.sigma_rels.unwrap_or_else(default_sigma_rels),
            update_every: self.update_every.unwrap_or_else(default_update_every),
            checkpoint_every: self
                .checkpoint_every
                .unwrap_or_else(default_checkpoint_every),
            max_checkpoints: self.max_checkpoints.unwrap_or_else(default_max_checkpoints),
            synthesis_precision: self
                .synthesis_precision
                .unwrap_or_else(default_synthesis_precision),
            offload_to_cpu: self.offload_to_cpu.unwrap_or(false),
            ignore_names: self.ignore_names,
            ignore_startswith_names: self.ignore_startswith_names,
            no_ema_names: self.no_ema_names,
        }
    }
}
