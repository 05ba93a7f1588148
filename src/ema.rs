//! Power-function EMA tracking for a single profile.
//!
//! [`KarrasEma`] keeps one running average of a model's named tensors under
//! the decay schedule from Karras et al., "Analyzing and Improving the
//! Training Dynamics of Diffusion Models". The tracked model is borrowed
//! per update call and never owned.

use std::collections::HashSet;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{EmaError, Result};
use crate::model::{EmaModel, StateDict};
use crate::profile::EmaProfile;

/// One exponential-moving-average tracker with a power-function profile.
///
/// The step counter advances by exactly 1 per [`update`](Self::update) call;
/// the average itself is only touched every `update_every` calls. The first
/// firing call copies the model state verbatim, later firing calls blend
/// with the profile's retention weight.
#[derive(Debug)]
pub struct KarrasEma {
    profile: EmaProfile,
    update_every: u64,
    frozen: bool,
    ignore_names: HashSet<String>,
    ignore_startswith_names: HashSet<String>,
    no_ema_names: HashSet<String>,
    device: Option<Device>,
    state: StateDict,
    step: u64,
    initted: bool,
}

impl KarrasEma {
    /// Create a tracker for the given profile.
    ///
    /// `update_every` is the throttle cadence in update calls and must be
    /// at least 1.
    pub fn new(profile: EmaProfile, update_every: u64) -> Result<Self> {
        if update_every == 0 {
            return Err(EmaError::config("update_every must be at least 1"));
        }
        Ok(Self {
            profile,
            update_every,
            frozen: false,
            ignore_names: HashSet::new(),
            ignore_startswith_names: HashSet::new(),
            no_ema_names: HashSet::new(),
            device: None,
            state: StateDict::new(),
            step: 0,
            initted: false,
        })
    }

    /// Create a tracker from optional width parameters.
    ///
    /// Exactly one of `sigma_rel` and `gamma` must be supplied.
    pub fn from_options(
        sigma_rel: Option<f64>,
        gamma: Option<f64>,
        update_every: u64,
    ) -> Result<Self> {
        Self::new(EmaProfile::resolve(sigma_rel, gamma)?, update_every)
    }

    /// Freeze or unfreeze the average.
    ///
    /// A frozen tracker still counts steps and still bootstraps on its
    /// first firing call, but never blends afterward.
    pub fn frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    /// Exclude tensors by exact name.
    pub fn ignore_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignore_names.extend(names);
        self
    }

    /// Exclude tensors whose name starts with any of the given prefixes.
    pub fn ignore_startswith_names(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.ignore_startswith_names.extend(prefixes);
        self
    }

    /// Exclude tensors from averaging by exact name.
    pub fn no_ema_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.no_ema_names.extend(names);
        self
    }

    /// Hold the averaged state on the given device.
    ///
    /// Incoming tensors are moved there during bootstrap and blending, so
    /// the average can live on the CPU while the model trains elsewhere.
    pub fn offload_to(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// The profile this tracker follows.
    pub fn profile(&self) -> EmaProfile {
        self.profile
    }

    /// Decay exponent of the tracked profile.
    pub fn gamma(&self) -> f64 {
        self.profile.gamma()
    }

    /// Relative width of the tracked profile.
    pub fn sigma_rel(&self) -> f64 {
        self.profile.sigma_rel()
    }

    /// Number of update calls seen so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Whether the average has been bootstrapped.
    pub fn is_initialized(&self) -> bool {
        self.initted
    }

    /// Whether blending is disabled.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Retention weight at the current step counter.
    pub fn beta(&self) -> f64 {
        self.profile.beta(self.step)
    }

    /// Whether a tensor with this name and element type takes part in
    /// averaging.
    pub fn tracks(&self, name: &str, dtype: DType) -> bool {
        if !dtype.is_float() {
            return false;
        }
        if self.ignore_names.contains(name) || self.no_ema_names.contains(name) {
            return false;
        }
        !self
            .ignore_startswith_names
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    /// Advance the tracker by one step, blending the model in when due.
    ///
    /// The counter always advances; the average is touched only when the
    /// pre-increment counter is a multiple of `update_every`, so the very
    /// first call always fires.
    pub fn update<M: EmaModel>(&mut self, model: &M) -> Result<()> {
        let step = self.step;
        self.step += 1;

        if step % self.update_every != 0 {
            return Ok(());
        }

        if !self.initted {
            self.bootstrap(model)?;
            self.initted = true;
            return Ok(());
        }

        if !self.frozen {
            self.blend(model)?;
        }
        Ok(())
    }

    /// Borrow the averaged state.
    pub fn state(&self) -> &StateDict {
        &self.state
    }

    /// An independent copy of the averaged state.
    pub fn state_dict(&self) -> Result<StateDict> {
        self.state.deep_clone()
    }

    fn eligible_tensors<M: EmaModel>(&self, model: &M) -> Vec<(String, Tensor)> {
        model
            .named_parameters()
            .into_iter()
            .chain(model.named_buffers())
            .filter(|(name, tensor)| self.tracks(name, tensor.dtype()))
            .collect()
    }

    fn bootstrap<M: EmaModel>(&mut self, model: &M) -> Result<()> {
        for (name, tensor) in self.eligible_tensors(model) {
            let owned = match &self.device {
                Some(device) if !tensor.device().same_device(device) => {
                    tensor.to_device(device)?
                }
                _ => tensor.copy()?,
            };
            self.state.insert(name, owned);
        }
        debug!(
            "bootstrapped EMA state for sigma_rel {:.4} with {} tensors",
            self.sigma_rel(),
            self.state.len()
        );
        Ok(())
    }

    fn blend<M: EmaModel>(&mut self, model: &M) -> Result<()> {
        let weight = 1.0 - self.beta();
        for (name, tensor) in self.eligible_tensors(model) {
            let averaged = self.state.get(&name).ok_or_else(|| {
                EmaError::state_mismatch(
                    &name,
                    "a tracked averaged tensor",
                    "no averaged tensor of this name",
                )
            })?;
            if averaged.dims() != tensor.dims() {
                return Err(EmaError::state_mismatch(
                    &name,
                    format!("shape {:?}", averaged.dims()),
                    format!("shape {:?}", tensor.dims()),
                ));
            }
            let current = tensor
                .to_device(averaged.device())?
                .to_dtype(averaged.dtype())?;
            let blended = (averaged + ((&current - averaged)? * weight)?)?;
            self.state.insert(name, blended);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::beta;
    use candle_core::Device;

    fn scalar_model(value: f32) -> StateDict {
        let mut model = StateDict::new();
        model.insert(
            "w".to_string(),
            Tensor::from_slice(&[value], 1, &Device::Cpu).unwrap(),
        );
        model
    }

    fn state_value(ema: &KarrasEma, name: &str) -> f32 {
        ema.state().get(name).unwrap().to_vec1::<f32>().unwrap()[0]
    }

    fn test_ema(update_every: u64) -> KarrasEma {
        KarrasEma::new(EmaProfile::from_gamma(1.0).unwrap(), update_every).unwrap()
    }

    #[test]
    fn test_update_every_zero_rejected() {
        let profile = EmaProfile::from_gamma(1.0).unwrap();
        assert!(KarrasEma::new(profile, 0).is_err());
    }

    #[test]
    fn test_from_options_enforces_exactly_one_width() {
        assert!(KarrasEma::from_options(Some(0.05), None, 10).is_ok());
        assert!(KarrasEma::from_options(None, Some(6.94), 10).is_ok());
        assert!(KarrasEma::from_options(Some(0.05), Some(6.94), 10).is_err());
        assert!(KarrasEma::from_options(None, None, 10).is_err());
    }

    #[test]
    fn test_step_counts_every_call() {
        let mut ema = test_ema(10);
        let model = scalar_model(1.0);
        for _ in 0..25 {
            ema.update(&model).unwrap();
        }
        assert_eq!(ema.step(), 25);
    }

    #[test]
    fn test_first_update_bootstraps_exactly() {
        let mut ema = test_ema(10);
        let model = scalar_model(3.25);
        ema.update(&model).unwrap();
        assert!(ema.is_initialized());
        assert_eq!(state_value(&ema, "w"), 3.25);
    }

    #[test]
    fn test_throttled_calls_leave_state_untouched() {
        let mut ema = test_ema(10);
        ema.update(&scalar_model(1.0)).unwrap();
        for _ in 1..10 {
            ema.update(&scalar_model(100.0)).unwrap();
        }
        // Calls at pre-increment steps 1..=9 are throttled.
        assert_eq!(state_value(&ema, "w"), 1.0);
        assert_eq!(ema.step(), 10);

        // The call at pre-increment step 10 fires and blends.
        ema.update(&scalar_model(100.0)).unwrap();
        assert!(state_value(&ema, "w") > 1.0);
    }

    #[test]
    fn test_blend_matches_scalar_recurrence() {
        let mut ema = test_ema(1);
        ema.update(&scalar_model(1.0)).unwrap();
        ema.update(&scalar_model(2.0)).unwrap();

        // Second call blends at the post-increment counter.
        let b = beta(1.0, 2);
        let expected = 1.0 * b + 2.0 * (1.0 - b);
        assert!((state_value(&ema, "w") as f64 - expected).abs() < 1e-6);
    }

    #[test]
    fn test_frozen_bootstraps_but_never_blends() {
        let mut ema = test_ema(1).frozen(true);
        ema.update(&scalar_model(5.0)).unwrap();
        for value in [6.0, 7.0, 8.0] {
            ema.update(&scalar_model(value)).unwrap();
        }
        assert_eq!(state_value(&ema, "w"), 5.0);
        assert_eq!(ema.step(), 4);
    }

    #[test]
    fn test_exclusion_rules() {
        let ema = test_ema(1)
            .ignore_names(["skip.weight".to_string()])
            .ignore_startswith_names(["head.".to_string()])
            .no_ema_names(["stats.mean".to_string()]);

        assert!(ema.tracks("body.weight", DType::F32));
        assert!(!ema.tracks("skip.weight", DType::F32));
        assert!(!ema.tracks("head.out.weight", DType::F32));
        assert!(!ema.tracks("stats.mean", DType::F32));
        assert!(!ema.tracks("body.step_count", DType::U32));
    }

    #[test]
    fn test_excluded_tensors_never_enter_state() {
        let mut model = scalar_model(1.0);
        model.insert(
            "counter".to_string(),
            Tensor::from_slice(&[4u32], 1, &Device::Cpu).unwrap(),
        );
        model.insert(
            "head.weight".to_string(),
            Tensor::from_slice(&[2f32], 1, &Device::Cpu).unwrap(),
        );

        let mut ema = test_ema(1).ignore_startswith_names(["head.".to_string()]);
        ema.update(&model).unwrap();

        assert_eq!(ema.state().len(), 1);
        assert!(ema.state().contains_key("w"));
    }

    #[test]
    fn test_state_dict_copy_is_independent() {
        let mut ema = test_ema(1);
        ema.update(&scalar_model(1.0)).unwrap();
        let snapshot = ema.state_dict().unwrap();

        ema.update(&scalar_model(10.0)).unwrap();
        assert_eq!(snapshot.get("w").unwrap().to_vec1::<f32>().unwrap()[0], 1.0);
    }

    #[test]
    fn test_new_model_tensor_after_bootstrap_is_an_error() {
        let mut ema = test_ema(1);
        ema.update(&scalar_model(1.0)).unwrap();

        let mut grown = scalar_model(1.0);
        grown.insert(
            "extra".to_string(),
            Tensor::from_slice(&[1f32], 1, &Device::Cpu).unwrap(),
        );
        let err = ema.update(&grown).unwrap_err();
        assert!(matches!(err, EmaError::StateMismatch { .. }));
    }

    #[test]
    fn test_offload_keeps_state_on_requested_device() {
        let mut ema = test_ema(1).offload_to(Device::Cpu);
        ema.update(&scalar_model(2.0)).unwrap();
        ema.update(&scalar_model(3.0)).unwrap();
        assert!(ema.state().get("w").unwrap().device().is_cpu());
    }

    #[test]
    fn test_bootstrap_copy_does_not_alias_model_storage() {
        let map = candle_nn::VarMap::new();
        {
            let mut data = map.data().lock().unwrap();
            data.insert(
                "w".to_string(),
                candle_core::Var::from_tensor(
                    &Tensor::from_slice(&[1f32], 1, &Device::Cpu).unwrap(),
                )
                .unwrap(),
            );
        }

        let mut ema = test_ema(1);
        ema.update(&map).unwrap();

        // Mutate the live model in place; the averaged copy must not move.
        let mut live = map;
        let mut state = StateDict::new();
        state.insert(
            "w".to_string(),
            Tensor::from_slice(&[50f32], 1, &Device::Cpu).unwrap(),
        );
        live.load_state(&state).unwrap();

        assert_eq!(state_value(&ema, "w"), 1.0);
    }
}
