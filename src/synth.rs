//! Weight solving and state combination for post-hoc synthesis.
//!
//! Synthesis approximates a never-maintained EMA profile as a linear
//! combination of stored checkpoints. The combination weights come from a
//! least-squares solve over profile overlaps: the Gram matrix holds pairwise
//! overlaps between stored checkpoints, the target vector holds each
//! checkpoint's overlap with the requested profile.

use candle_core::DType;
use nalgebra::{DMatrix, DVector};
use tracing::warn;

use crate::checkpoint::{read_checkpoint_state, CheckpointRef};
use crate::error::{EmaError, Result};
use crate::model::StateDict;
use crate::profile::p_dot_p;

/// Singular value cutoff for the regularized least-squares fallback.
const SVD_EPSILON: f64 = 1e-12;

/// Solve for the combination weights reconstructing a target profile.
///
/// `t_i` and `gamma_i` describe the stored checkpoints, `t_r` and `gamma_r`
/// the reconstruction target. The system is solved in `f64`; an exactly or
/// nearly singular Gram matrix falls back to a regularized least-squares
/// solve.
pub fn solve_weights(t_i: &[f64], gamma_i: &[f64], t_r: f64, gamma_r: f64) -> Result<Vec<f64>> {
    if t_i.is_empty() {
        return Err(EmaError::synthesis("no checkpoints to solve over"));
    }
    if t_i.len() != gamma_i.len() {
        return Err(EmaError::synthesis(format!(
            "checkpoint metadata out of sync: {} steps vs {} gammas",
            t_i.len(),
            gamma_i.len()
        )));
    }

    let n = t_i.len();
    let gram = DMatrix::from_fn(n, n, |row, col| {
        p_dot_p(t_i[row], gamma_i[row], t_i[col], gamma_i[col])
    });
    let target = DVector::from_fn(n, |row, _| p_dot_p(t_i[row], gamma_i[row], t_r, gamma_r));

    let weights = match gram.clone().lu().solve(&target) {
        Some(solution) if solution.iter().all(|w| w.is_finite()) => solution,
        _ => {
            warn!("gram matrix is singular, falling back to regularized least-squares");
            let solution = gram
                .svd(true, true)
                .solve(&target, SVD_EPSILON)
                .map_err(EmaError::synthesis)?;
            if !solution.iter().all(|w| w.is_finite()) {
                return Err(EmaError::synthesis(
                    "could not solve for finite synthesis weights",
                ));
            }
            solution
        }
    };

    Ok(weights.iter().copied().collect())
}

/// Combine stored checkpoints into one synthesized state.
///
/// Accumulation runs in `f64` on the CPU; the result is cast to
/// `output_dtype` at the end. The first checkpoint defines the expected
/// tensor names and shapes; any later checkpoint disagreeing with it is a
/// synthesis error.
pub fn combine_checkpoints(
    refs: &[CheckpointRef],
    weights: &[f64],
    output_dtype: DType,
) -> Result<StateDict> {
    if refs.is_empty() {
        return Err(EmaError::synthesis("no checkpoints to combine"));
    }
    if refs.len() != weights.len() {
        return Err(EmaError::synthesis(format!(
            "{} checkpoints but {} weights",
            refs.len(),
            weights.len()
        )));
    }

    let first = read_checkpoint_state(&refs[0].path)?;
    let mut accumulators = StateDict::new();
    for (name, tensor) in &first {
        accumulators.insert(name.clone(), tensor.to_dtype(DType::F64)?.zeros_like()?);
    }

    for (reference, &weight) in refs.iter().zip(weights) {
        let state = read_checkpoint_state(&reference.path)?;
        for (name, acc) in accumulators.iter_mut() {
            let tensor = state.get(name).ok_or_else(|| {
                EmaError::synthesis(format!(
                    "checkpoint {} is missing tensor {name}",
                    reference.path.display()
                ))
            })?;
            if tensor.dims() != acc.dims() {
                return Err(EmaError::synthesis(format!(
                    "checkpoint {} has shape {:?} for tensor {name}, expected {:?}",
                    reference.path.display(),
                    tensor.dims(),
                    acc.dims()
                )));
            }
            let contribution = (tensor.to_dtype(DType::F64)? * weight)?;
            *acc = ((&*acc) + contribution)?;
        }
    }

    let mut synthesized = StateDict::new();
    for (name, acc) in accumulators {
        synthesized.insert(name, acc.to_dtype(output_dtype)?);
    }
    Ok(synthesized)
}
