//! Checkpoint persistence for EMA profiles.
//!
//! Each profile's averaged state is periodically written to the checkpoint
//! directory as a safetensors file and old files are rotated out, keeping a
//! bounded history per profile for later synthesis.
//!
//! # Format
//!
//! Files are named `{profile_index}.{step}.safetensors`; the identity of a
//! checkpoint is recoverable from its filename alone. Averaged tensors are
//! stored in `f64` under the `ema_model.` key prefix, alongside `step` and
//! `initted` counters mirroring the engine that produced them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use crate::ema::KarrasEma;
use crate::error::{EmaError, Result};
use crate::model::StateDict;

/// File extension for checkpoint files.
pub const CHECKPOINT_EXTENSION: &str = "safetensors";

/// Key prefix for averaged tensors inside a checkpoint file.
pub const STATE_KEY_PREFIX: &str = "ema_model.";

/// Element type used for persisted averages.
///
/// Checkpoints are written at higher precision than the live running state
/// so rounding error does not compound before synthesis.
pub const CHECKPOINT_DTYPE: DType = DType::F64;

const STEP_KEY: &str = "step";
const INITTED_KEY: &str = "initted";

/// One stored checkpoint's identity and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    /// Position of the originating profile in the profile set.
    pub profile_index: usize,
    /// Global step the snapshot was taken at.
    pub step: u64,
    /// Location of the safetensors file.
    pub path: PathBuf,
}

/// Build the canonical file name for a checkpoint.
pub fn checkpoint_file_name(profile_index: usize, step: u64) -> String {
    format!("{profile_index}.{step}.{CHECKPOINT_EXTENSION}")
}

/// Recover `(profile_index, step)` from a checkpoint file name.
///
/// Returns `None` for names that do not follow the canonical form.
pub fn parse_checkpoint_file_name(name: &str) -> Option<(usize, u64)> {
    let stem = name.strip_suffix(&format!(".{CHECKPOINT_EXTENSION}"))?;
    let (index, step) = stem.split_once('.')?;
    if step.contains('.') {
        return None;
    }
    Some((index.parse().ok()?, step.parse().ok()?))
}

/// Read the averaged state back out of a checkpoint file.
///
/// Strips the `ema_model.` prefix and drops the counter entries; tensors
/// are loaded onto the CPU.
pub fn read_checkpoint_state(path: &Path) -> Result<StateDict> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let mut state = StateDict::new();
    for (key, tensor) in tensors {
        if let Some(name) = key.strip_prefix(STATE_KEY_PREFIX) {
            state.insert(name.to_string(), tensor);
        }
    }
    if state.is_empty() {
        return Err(EmaError::checkpoint(format!(
            "no averaged tensors found in {}",
            path.display()
        )));
    }
    Ok(state)
}

/// Durable, bounded checkpoint history for a set of EMA profiles.
#[derive(Debug)]
pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
    checkpoint_every: u64,
    max_checkpoints: usize,
}

impl CheckpointStore {
    /// Create a store, creating the checkpoint directory if needed.
    pub fn create(
        checkpoint_dir: impl AsRef<Path>,
        checkpoint_every: u64,
        max_checkpoints: usize,
    ) -> Result<Self> {
        let store = Self::validated(checkpoint_dir, checkpoint_every, max_checkpoints)?;
        fs::create_dir_all(&store.checkpoint_dir)?;
        Ok(store)
    }

    /// Open a store over an existing checkpoint directory.
    pub fn open(
        checkpoint_dir: impl AsRef<Path>,
        checkpoint_every: u64,
        max_checkpoints: usize,
    ) -> Result<Self> {
        let store = Self::validated(checkpoint_dir, checkpoint_every, max_checkpoints)?;
        if !store.checkpoint_dir.is_dir() {
            return Err(EmaError::checkpoint(format!(
                "checkpoint directory does not exist: {}",
                store.checkpoint_dir.display()
            )));
        }
        Ok(store)
    }

    fn validated(
        checkpoint_dir: impl AsRef<Path>,
        checkpoint_every: u64,
        max_checkpoints: usize,
    ) -> Result<Self> {
        if checkpoint_every == 0 {
            return Err(EmaError::config("checkpoint_every must be at least 1"));
        }
        if max_checkpoints == 0 {
            return Err(EmaError::config("max_checkpoints must be at least 1"));
        }
        Ok(Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            checkpoint_every,
            max_checkpoints,
        })
    }

    /// Directory the store writes to.
    pub fn dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Retained history bound per profile.
    pub fn max_checkpoints(&self) -> usize {
        self.max_checkpoints
    }

    /// Whether a checkpoint cycle is due at the given global step.
    pub fn should_checkpoint(&self, step: u64) -> bool {
        step > 0 && step % self.checkpoint_every == 0
    }

    /// Run a checkpoint cycle when due; returns whether one ran.
    ///
    /// A completed cycle is followed by pruning.
    pub fn maybe_checkpoint(&self, engines: &[KarrasEma], step: u64) -> Result<bool> {
        if !self.should_checkpoint(step) {
            return Ok(false);
        }
        self.checkpoint(engines, step)?;
        self.prune()?;
        Ok(true)
    }

    /// Write one checkpoint per engine at the given global step.
    ///
    /// A failing profile does not stop the remaining profiles from being
    /// attempted; the first failure is returned once the cycle finishes.
    pub fn checkpoint(&self, engines: &[KarrasEma], step: u64) -> Result<()> {
        if !self.checkpoint_dir.is_dir() {
            return Err(EmaError::checkpoint(format!(
                "checkpoint directory does not exist: {}",
                self.checkpoint_dir.display()
            )));
        }
        let mut first_failure = None;
        for (profile_index, engine) in engines.iter().enumerate() {
            match self.write_profile(profile_index, engine, step) {
                Ok(path) => debug!("wrote checkpoint {}", path.display()),
                Err(err) => {
                    warn!(
                        "checkpoint write failed for profile {profile_index} at step {step}: {err}"
                    );
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_profile(
        &self,
        profile_index: usize,
        engine: &KarrasEma,
        step: u64,
    ) -> Result<PathBuf> {
        let path = self
            .checkpoint_dir
            .join(checkpoint_file_name(profile_index, step));

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (name, tensor) in engine.state() {
            tensors.insert(
                format!("{STATE_KEY_PREFIX}{name}"),
                tensor.to_dtype(CHECKPOINT_DTYPE)?,
            );
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::from_slice(&[engine.step() as i64], 1, &Device::Cpu)?,
        );
        tensors.insert(
            INITTED_KEY.to_string(),
            Tensor::from_slice(&[u8::from(engine.is_initialized())], 1, &Device::Cpu)?,
        );

        candle_core::safetensors::save(&tensors, &path)?;
        Ok(path)
    }

    /// Delete the oldest checkpoints of each profile beyond the retained
    /// bound.
    pub fn prune(&self) -> Result<()> {
        let mut by_profile: HashMap<usize, Vec<CheckpointRef>> = HashMap::new();
        for reference in self.scan()? {
            by_profile
                .entry(reference.profile_index)
                .or_default()
                .push(reference);
        }
        for (profile_index, mut refs) in by_profile {
            refs.sort_by_key(|r| r.step);
            let excess = refs.len().saturating_sub(self.max_checkpoints);
            for stale in &refs[..excess] {
                fs::remove_file(&stale.path)?;
                debug!(
                    "pruned checkpoint for profile {profile_index} at step {}",
                    stale.step
                );
            }
        }
        Ok(())
    }

    /// Step-ordered listing of one profile's checkpoints.
    ///
    /// Each call rescans the directory, so the listing always reflects the
    /// current contents.
    pub fn list(&self, profile_index: usize) -> Result<impl Iterator<Item = CheckpointRef>> {
        let mut refs: Vec<CheckpointRef> = self
            .scan()?
            .into_iter()
            .filter(|r| r.profile_index == profile_index)
            .collect();
        refs.sort_by_key(|r| r.step);
        Ok(refs.into_iter())
    }

    /// All checkpoints in the store, ordered by profile then step.
    pub fn scan(&self) -> Result<Vec<CheckpointRef>> {
        let mut refs = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((profile_index, step)) = parse_checkpoint_file_name(name) {
                refs.push(CheckpointRef {
                    profile_index,
                    step,
                    path,
                });
            }
        }
        refs.sort_by_key(|r| (r.profile_index, r.step));
        Ok(refs)
    }

    /// Largest step present across all profiles, if any checkpoint exists.
    pub fn max_step(&self) -> Result<Option<u64>> {
        Ok(self.scan()?.iter().map(|r| r.step).max())
    }
}
