//! Power-function EMA profiles.
//!
//! A profile is the shape of one exponential-moving-average decay curve,
//! parameterized either by the exponent `gamma` or by the human-facing
//! relative width `sigma_rel`. The two are related by a bijection: wider
//! windows (larger `sigma_rel`) correspond to smaller `gamma`.

use crate::error::{EmaError, Result};

/// Upper bound (exclusive) for `sigma_rel`, equal to `1 / sqrt(12)`.
///
/// At this width the corresponding `gamma` reaches zero; wider profiles have
/// no positive-`gamma` representation.
pub const MAX_SIGMA_REL: f64 = 0.288_675_134_594_812_9;

/// One EMA profile shape.
///
/// Immutable once constructed. Carries both parameterizations so callers can
/// read whichever is convenient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaProfile {
    gamma: f64,
    sigma_rel: f64,
}

impl EmaProfile {
    /// Construct a profile from its relative width.
    pub fn from_sigma_rel(sigma_rel: f64) -> Result<Self> {
        let gamma = sigma_rel_to_gamma(sigma_rel)?;
        Ok(Self { gamma, sigma_rel })
    }

    /// Construct a profile from its decay exponent.
    pub fn from_gamma(gamma: f64) -> Result<Self> {
        let sigma_rel = gamma_to_sigma_rel(gamma)?;
        Ok(Self { gamma, sigma_rel })
    }

    /// Resolve a profile from optional parameters.
    ///
    /// Exactly one of `sigma_rel` and `gamma` must be supplied; anything
    /// else is a configuration error.
    pub fn resolve(sigma_rel: Option<f64>, gamma: Option<f64>) -> Result<Self> {
        match (sigma_rel, gamma) {
            (Some(s), None) => Self::from_sigma_rel(s),
            (None, Some(g)) => Self::from_gamma(g),
            (Some(_), Some(_)) => Err(EmaError::config(
                "supply exactly one of sigma_rel and gamma, not both",
            )),
            (None, None) => Err(EmaError::config(
                "supply exactly one of sigma_rel and gamma, got neither",
            )),
        }
    }

    /// Decay exponent of this profile.
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Relative width of this profile.
    pub fn sigma_rel(&self) -> f64 {
        self.sigma_rel
    }

    /// Retention weight for the running average at the given step.
    pub fn beta(&self, step: u64) -> f64 {
        beta(self.gamma, step)
    }
}

/// Retention weight `(1 - 1/(step + 1))^(1 + gamma)`.
///
/// This is the fraction of the existing average kept at an update; the
/// incoming value receives `1 - beta`. At step 0 the weight is 0, so the
/// first blended update copies the incoming value outright. As `step` grows
/// the weight approaches 1 and the average stabilizes.
pub fn beta(gamma: f64, step: u64) -> f64 {
    let t = step as f64;
    (1.0 - 1.0 / (t + 1.0)).powf(1.0 + gamma)
}

/// Convert a relative width to its decay exponent.
///
/// Solves the cubic `g^3 + 7g^2 + (16 - t)g + (12 - t) = 0` with
/// `t = sigma_rel^-2` for its largest real root, by bisection in `f64`.
/// Valid widths lie in `(0, MAX_SIGMA_REL)`.
pub fn sigma_rel_to_gamma(sigma_rel: f64) -> Result<f64> {
    if !sigma_rel.is_finite() || sigma_rel <= 0.0 || sigma_rel >= MAX_SIGMA_REL {
        return Err(EmaError::config(format!(
            "sigma_rel must lie in (0, {MAX_SIGMA_REL:.4}), got {sigma_rel}"
        )));
    }
    let t = sigma_rel.powi(-2);
    let poly = |g: f64| g * g * g + 7.0 * g * g + (16.0 - t) * g + (12.0 - t);

    // t > 12 inside the valid width range, so poly(0) < 0 and the largest
    // root is the unique positive one.
    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64;
    while poly(hi) < 0.0 {
        hi *= 2.0;
    }
    for _ in 0..128 {
        let mid = 0.5 * (lo + hi);
        if poly(mid) < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// Convert a decay exponent back to its relative width.
///
/// `sigma_rel = sqrt((g + 1) / ((g + 2)^2 (g + 3)))`, the inverse of
/// [`sigma_rel_to_gamma`] over positive exponents.
pub fn gamma_to_sigma_rel(gamma: f64) -> Result<f64> {
    if !gamma.is_finite() || gamma <= 0.0 {
        return Err(EmaError::config(format!(
            "gamma must be a positive finite number, got {gamma}"
        )));
    }
    let g = gamma;
    Ok(((g + 1.0) / ((g + 2.0) * (g + 2.0) * (g + 3.0))).sqrt())
}

/// Overlap between two power-function profiles.
///
/// `t_a`/`t_b` are the profiles' step positions (at least 1), `gamma_a`/
/// `gamma_b` their exponents. The Gram matrix of the synthesis solve is
/// built from pairwise overlaps, and the target vector from overlaps
/// against the requested profile.
pub fn p_dot_p(t_a: f64, gamma_a: f64, t_b: f64, gamma_b: f64) -> f64 {
    let t_ratio = t_a / t_b;
    let t_exp = if t_a < t_b { gamma_b } else { -gamma_a };
    let t_max = t_a.max(t_b);
    let num = (gamma_a + 1.0) * (gamma_b + 1.0) * t_ratio.powf(t_exp);
    let den = (gamma_a + gamma_b + 1.0) * t_max;
    num / den
}
