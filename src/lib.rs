//! Post-hoc EMA synthesis for model weights
//!
//! This crate maintains exponential moving averages of a model's weights
//! under the power-function decay schedule from Karras et al., "Analyzing
//! and Improving the Training Dynamics of Diffusion Models", and
//! reconstructs, after training, an EMA profile of arbitrary width that was
//! never tracked online:
//!
//! - A small set of basis profiles is averaged online at negligible cost
//! - Each profile's state is periodically checkpointed to disk and rotated
//! - Any target width is later synthesized as a least-squares combination
//!   of the stored checkpoints, without retraining
//!
//! Averaging width is the single most sensitive EMA hyperparameter and the
//! hardest to pick in advance; post-hoc synthesis turns it into a choice
//! made after training, when it can be swept cheaply.
//!
//! # Quick Start
//!
//! ```no_run
//! use candle_nn::VarMap;
//! use posthoc_ema_rs::{PostHocEma, PostHocEmaConfig};
//!
//! # fn main() -> posthoc_ema_rs::Result<()> {
//! let model = VarMap::new();
//! let config = PostHocEmaConfig::builder("checkpoints")
//!     .sigma_rels(vec![0.05, 0.28])
//!     .build();
//! let mut posthoc = PostHocEma::from_model(&model, config)?;
//!
//! // Training loop
//! for _ in 0..3000 {
//!     // ... optimizer step ...
//!     posthoc.update(&model)?;
//! }
//!
//! // Afterwards: sweep widths that were never tracked
//! let state = posthoc.synthesize(0.15, None)?;
//! # let _ = state;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`config`] - Tracker configuration with TOML load/save
//! - [`error`] - Error types and result alias
//! - [`profile`] - Decay schedule, width transforms and profile overlap
//! - [`model`] - The [`EmaModel`] seam between tracker and model
//! - [`ema`] - Single-profile EMA engine
//! - [`checkpoint`] - Bounded on-disk checkpoint history
//! - [`synth`] - Reconstruction weight solve and checkpoint combination
//! - [`posthoc`] - Orchestration and the synthesis API

#![warn(missing_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in ML numerical code
#![allow(clippy::cast_precision_loss)]

pub mod checkpoint;
pub mod config;
pub mod ema;
pub mod error;
pub mod model;
pub mod posthoc;
pub mod profile;
pub mod synth;

pub use checkpoint::{CheckpointRef, CheckpointStore};
pub use config::{PostHocEmaConfig, PostHocEmaConfigBuilder, Precision};
pub use ema::KarrasEma;
pub use error::{EmaError, Result};
pub use model::{EmaModel, StateDict};
pub use posthoc::PostHocEma;
pub use profile::{gamma_to_sigma_rel, sigma_rel_to_gamma, EmaProfile};
pub use synth::{combine_checkpoints, solve_weights};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{PostHocEmaConfig, Precision};
    pub use crate::ema::KarrasEma;
    pub use crate::error::{EmaError, Result};
    pub use crate::model::{EmaModel, StateDict};
    pub use crate::posthoc::PostHocEma;
    pub use crate::profile::EmaProfile;
}
