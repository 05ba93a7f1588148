//! Model access seam.
//!
//! The averaging machinery never owns the model it tracks. Each update
//! borrows the model through [`EmaModel`], reads its named tensors, and
//! returns; the caller is free to swap the tracked instance between calls.
//! The same trait carries the reverse direction: loading a synthesized
//! state back into an architecture instance with strict structural checks.

use std::collections::BTreeMap;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{EmaError, Result};

/// Ordered mapping from parameter name to tensor.
///
/// Used for averaged state, checkpoint content, and synthesized output.
/// The `BTreeMap` ordering keeps iteration deterministic, which in turn
/// keeps floating-point accumulation order reproducible.
pub type StateDict = BTreeMap<String, Tensor>;

/// A model whose named numeric state can be averaged and replaced.
pub trait EmaModel {
    /// Named trainable parameters, deterministically ordered by name.
    fn named_parameters(&self) -> Vec<(String, Tensor)>;

    /// Named non-trainable buffers, deterministically ordered by name.
    ///
    /// Buffers take part in averaging exactly like parameters; models
    /// without buffers keep the default empty implementation.
    fn named_buffers(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    /// Load a state into this model with strict structural matching.
    ///
    /// Every entry in `state` must name an existing tensor of identical
    /// shape, otherwise [`EmaError::StateMismatch`] is returned. Tensors
    /// present on the model but absent from `state` are left untouched.
    fn load_state(&mut self, state: &StateDict) -> Result<()>;

    /// Produce an independent copy of this model.
    ///
    /// The copy must not share tensor storage with the original; mutating
    /// one afterwards must not affect the other.
    fn deep_clone(&self) -> Result<Self>
    where
        Self: Sized;
}

impl EmaModel for VarMap {
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let data = self.data().lock().unwrap();
        let mut entries: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        let data = self.data().lock().unwrap();
        for (name, tensor) in state {
            let var = data.get(name).ok_or_else(|| {
                EmaError::state_mismatch(name, "a matching model tensor", "no tensor of this name")
            })?;
            if var.dims() != tensor.dims() {
                return Err(EmaError::state_mismatch(
                    name,
                    format!("shape {:?}", var.dims()),
                    format!("shape {:?}", tensor.dims()),
                ));
            }
            let src = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&src)?;
        }
        Ok(())
    }

    fn deep_clone(&self) -> Result<Self> {
        let clone = VarMap::new();
        {
            let src = self.data().lock().unwrap();
            let mut dst = clone.data().lock().unwrap();
            for (name, var) in src.iter() {
                // from_tensor shallow-clones an input that is already a
                // variable; a detached view takes the copying path instead.
                dst.insert(name.clone(), Var::from_tensor(&var.detach())?);
            }
        }
        Ok(clone)
    }
}

/// A bare named-tensor map is the minimal model.
impl EmaModel for StateDict {
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect()
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        for (name, tensor) in state {
            let existing = self.get(name).ok_or_else(|| {
                EmaError::state_mismatch(name, "a matching model tensor", "no tensor of this name")
            })?;
            if existing.dims() != tensor.dims() {
                return Err(EmaError::state_mismatch(
                    name,
                    format!("shape {:?}", existing.dims()),
                    format!("shape {:?}", tensor.dims()),
                ));
            }
            let src = tensor
                .to_device(existing.device())?
                .to_dtype(existing.dtype())?;
            self.insert(name.clone(), src);
        }
        Ok(())
    }

    fn deep_clone(&self) -> Result<Self> {
        let mut clone = StateDict::new();
        for (name, tensor) in self {
            clone.insert(name.clone(), tensor.copy()?);
        }
        Ok(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn demo_var_map() -> VarMap {
        let map = VarMap::new();
        let weight =
            Tensor::from_slice(&[1f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        let bias = Tensor::from_slice(&[0.5f32, -0.5], 2, &Device::Cpu).unwrap();
        {
            let mut data = map.data().lock().unwrap();
            data.insert(
                "linear.weight".to_string(),
                Var::from_tensor(&weight).unwrap(),
            );
            data.insert("linear.bias".to_string(), Var::from_tensor(&bias).unwrap());
        }
        map
    }

    #[test]
    fn test_var_map_parameters_sorted_by_name() {
        let map = demo_var_map();
        let names: Vec<String> = map
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["linear.bias", "linear.weight"]);
    }

    #[test]
    fn test_var_map_load_state_overwrites_values() {
        let mut map = demo_var_map();
        let mut state = StateDict::new();
        state.insert(
            "linear.bias".to_string(),
            Tensor::from_slice(&[9f32, 9.0], 2, &Device::Cpu).unwrap(),
        );
        map.load_state(&state).unwrap();

        let params = map.named_parameters();
        let bias = &params[0].1;
        assert_eq!(bias.to_vec1::<f32>().unwrap(), vec![9.0, 9.0]);
        let weight = &params[1].1;
        assert_eq!(
            weight.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
    }

    #[test]
    fn test_var_map_load_state_converts_dtype() {
        let mut map = demo_var_map();
        let mut state = StateDict::new();
        state.insert(
            "linear.bias".to_string(),
            Tensor::from_slice(&[1f64, 2.0], 2, &Device::Cpu).unwrap(),
        );
        map.load_state(&state).unwrap();

        let params = map.named_parameters();
        assert_eq!(params[0].1.dtype(), DType::F32);
        assert_eq!(params[0].1.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_var_map_load_state_rejects_unknown_name() {
        let mut map = demo_var_map();
        let mut state = StateDict::new();
        state.insert(
            "missing.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = map.load_state(&state).unwrap_err();
        assert!(matches!(err, EmaError::StateMismatch { .. }));
    }

    #[test]
    fn test_var_map_load_state_rejects_shape_mismatch() {
        let mut map = demo_var_map();
        let mut state = StateDict::new();
        state.insert(
            "linear.weight".to_string(),
            Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = map.load_state(&state).unwrap_err();
        assert!(matches!(err, EmaError::StateMismatch { .. }));
    }

    #[test]
    fn test_var_map_deep_clone_is_independent() {
        let map = demo_var_map();
        let clone = map.deep_clone().unwrap();

        let mut state = StateDict::new();
        state.insert(
            "linear.bias".to_string(),
            Tensor::from_slice(&[7f32, 7.0], 2, &Device::Cpu).unwrap(),
        );
        let mut original = map;
        original.load_state(&state).unwrap();

        let cloned_bias = &clone.named_parameters()[0].1;
        assert_eq!(cloned_bias.to_vec1::<f32>().unwrap(), vec![0.5, -0.5]);
    }

    #[test]
    fn test_var_map_load_into_clone_leaves_original_untouched() {
        let map = demo_var_map();
        let mut clone = map.deep_clone().unwrap();

        let mut state = StateDict::new();
        state.insert(
            "linear.bias".to_string(),
            Tensor::from_slice(&[9f32, 9.0], 2, &Device::Cpu).unwrap(),
        );
        clone.load_state(&state).unwrap();

        let cloned_bias = &clone.named_parameters()[0].1;
        assert_eq!(cloned_bias.to_vec1::<f32>().unwrap(), vec![9.0, 9.0]);
        let original_bias = &map.named_parameters()[0].1;
        assert_eq!(original_bias.to_vec1::<f32>().unwrap(), vec![0.5, -0.5]);
    }

    #[test]
    fn test_state_dict_model_round_trip() {
        let mut model = StateDict::new();
        model.insert(
            "w".to_string(),
            Tensor::from_slice(&[1f32, 2.0], 2, &Device::Cpu).unwrap(),
        );

        let clone = model.deep_clone().unwrap();
        let mut state = StateDict::new();
        state.insert(
            "w".to_string(),
            Tensor::from_slice(&[5f32, 6.0], 2, &Device::Cpu).unwrap(),
        );
        model.load_state(&state).unwrap();

        assert_eq!(
            model.get("w").unwrap().to_vec1::<f32>().unwrap(),
            vec![5.0, 6.0]
        );
        assert_eq!(
            clone.get("w").unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0]
        );
    }
}
