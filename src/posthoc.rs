//! Post-hoc EMA over a set of tracked profiles.
//!
//! [`PostHocEma`] ties the pieces together: driven once per training step,
//! it updates one [`KarrasEma`] engine per configured width, periodically
//! writes their averaged state to a [`CheckpointStore`], and later
//! reconstructs a profile of arbitrary width from the stored history by a
//! least-squares combination of checkpoints.
//!
//! # Example
//!
//! ```no_run
//! use candle_nn::VarMap;
//! use posthoc_ema_rs::{PostHocEma, PostHocEmaConfig};
//!
//! # fn main() -> posthoc_ema_rs::Result<()> {
//! let model = VarMap::new();
//! let config = PostHocEmaConfig::new("checkpoints");
//! let mut posthoc = PostHocEma::from_model(&model, config)?;
//!
//! for _ in 0..3000 {
//!     // ... one optimizer step ...
//!     posthoc.update(&model)?;
//! }
//!
//! // Reconstruct a width that was never tracked online.
//! let state = posthoc.synthesize(0.15, None)?;
//! # let _ = state;
//! # Ok(())
//! # }
//! ```

use candle_core::Device;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::config::PostHocEmaConfig;
use crate::ema::KarrasEma;
use crate::error::{EmaError, Result};
use crate::model::{EmaModel, StateDict};
use crate::profile::EmaProfile;
use crate::synth::{combine_checkpoints, solve_weights};

/// Orchestrates a fixed set of EMA engines, their checkpoint history and
/// post-hoc synthesis.
///
/// Construct with [`from_model`](Self::from_model) for training, or with
/// [`from_dir`](Self::from_dir) to synthesize from an existing checkpoint
/// directory without a model.
#[derive(Debug)]
pub struct PostHocEma {
    config: PostHocEmaConfig,
    engines: Vec<KarrasEma>,
    store: CheckpointStore,
    step: u64,
}

impl PostHocEma {
    /// Set up tracking for a model, creating the checkpoint directory and
    /// one engine per configured width.
    ///
    /// The model is only borrowed here and at each
    /// [`update`](Self::update); each engine copies its state at its first
    /// firing update, not at construction.
    pub fn from_model<M: EmaModel>(model: &M, config: PostHocEmaConfig) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::create(
            &config.checkpoint_dir,
            config.checkpoint_every,
            config.max_checkpoints,
        )?;

        let mut engines = Vec::with_capacity(config.sigma_rels.len());
        for profile in config.profiles()? {
            let mut engine = KarrasEma::new(profile, config.update_every)?
                .ignore_names(config.ignore_names.iter().cloned())
                .ignore_startswith_names(config.ignore_startswith_names.iter().cloned())
                .no_ema_names(config.no_ema_names.iter().cloned());
            if config.offload_to_cpu {
                engine = engine.offload_to(Device::Cpu);
            }
            engines.push(engine);
        }

        let tensor_count = model.named_parameters().len() + model.named_buffers().len();
        info!(
            "tracking {} tensors across {} EMA profiles, checkpointing to {}",
            tensor_count,
            engines.len(),
            store.dir().display()
        );

        Ok(Self {
            config,
            engines,
            store,
            step: 0,
        })
    }

    /// Open an existing checkpoint directory for synthesis only.
    ///
    /// No engines are constructed and [`update`](Self::update) is an error
    /// on the returned instance. The configured `sigma_rels` must match the
    /// ones the checkpoints were written with, since checkpoint files carry
    /// only the profile's position, not its width.
    pub fn from_dir(config: PostHocEmaConfig) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::open(
            &config.checkpoint_dir,
            config.checkpoint_every,
            config.max_checkpoints,
        )?;

        let available = store.scan()?.len();
        info!(
            "opened {} with {} checkpoints for synthesis",
            store.dir().display(),
            available
        );

        Ok(Self {
            config,
            engines: Vec::new(),
            store,
            step: 0,
        })
    }

    /// Advance every engine by one step and checkpoint when due.
    ///
    /// Call once per training step. The checkpoint cadence counts these
    /// calls, independent of each engine's `update_every` throttle.
    pub fn update<M: EmaModel>(&mut self, model: &M) -> Result<()> {
        if self.engines.is_empty() {
            return Err(EmaError::config(
                "this instance was opened for synthesis only; use from_model to track updates",
            ));
        }

        for engine in &mut self.engines {
            engine.update(model)?;
        }
        self.step += 1;

        if self.store.maybe_checkpoint(&self.engines, self.step)? {
            info!(
                "checkpointed {} profiles at step {}",
                self.engines.len(),
                self.step
            );
        }
        Ok(())
    }

    /// Synthesize the averaged state for an arbitrary relative width.
    ///
    /// `step` defaults to the latest checkpointed step; requesting a step
    /// beyond it is an error. The result is an ordered name-to-tensor
    /// mapping at the configured synthesis precision, on the CPU.
    pub fn synthesize(&self, sigma_rel: f64, step: Option<u64>) -> Result<StateDict> {
        self.synthesize_profile(EmaProfile::from_sigma_rel(sigma_rel)?, step)
    }

    /// Synthesize the averaged state for an arbitrary target profile.
    ///
    /// See [`synthesize`](Self::synthesize).
    pub fn synthesize_profile(
        &self,
        profile: EmaProfile,
        step: Option<u64>,
    ) -> Result<StateDict> {
        let refs = self.store.scan()?;
        if refs.is_empty() {
            return Err(EmaError::synthesis(format!(
                "no checkpoints found in {}",
                self.store.dir().display()
            )));
        }

        let profiles = self.config.profiles()?;
        let mut t_i = Vec::with_capacity(refs.len());
        let mut gamma_i = Vec::with_capacity(refs.len());
        for reference in &refs {
            let source = profiles.get(reference.profile_index).ok_or_else(|| {
                EmaError::synthesis(format!(
                    "checkpoint {} references profile index {} but only {} widths are configured",
                    reference.path.display(),
                    reference.profile_index,
                    profiles.len()
                ))
            })?;
            t_i.push(reference.step.max(1) as f64);
            gamma_i.push(source.gamma());
        }

        let max_step = refs.iter().map(|r| r.step).max().unwrap_or(0);
        let target_step = step.unwrap_or(max_step);
        if target_step > max_step {
            return Err(EmaError::synthesis(format!(
                "requested step {target_step} exceeds the latest checkpointed step {max_step}"
            )));
        }

        let weights = solve_weights(
            &t_i,
            &gamma_i,
            target_step.max(1) as f64,
            profile.gamma(),
        )?;
        debug!(
            "synthesizing sigma_rel {:.4} at step {} from {} checkpoints, weights {:?}",
            profile.sigma_rel(),
            target_step,
            refs.len(),
            weights
        );

        combine_checkpoints(&refs, &weights, self.config.synthesis_precision.dtype())
    }

    /// Run a closure against a model populated with synthesized state.
    ///
    /// Deep-clones `base`, loads the synthesized state into the clone with
    /// strict name and shape matching, and hands the clone to `f`. The
    /// clone is dropped when the closure returns; `base` is never touched.
    pub fn with_synthesized_model<M, F, R>(
        &self,
        base: &M,
        sigma_rel: f64,
        step: Option<u64>,
        f: F,
    ) -> Result<R>
    where
        M: EmaModel,
        F: FnOnce(&M) -> R,
    {
        let state = self.synthesize(sigma_rel, step)?;
        let mut model = base.deep_clone()?;
        model.load_state(&state)?;
        Ok(f(&model))
    }

    /// The engines in configured width order.
    ///
    /// A live engine's [`state`](KarrasEma::state) can be read directly for
    /// inference from one of the tracked widths without synthesis.
    pub fn engines(&self) -> &[KarrasEma] {
        &self.engines
    }

    /// Number of update calls seen so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The active configuration.
    pub fn config(&self) -> &PostHocEmaConfig {
        &self.config
    }

    /// The underlying checkpoint store.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }
}
