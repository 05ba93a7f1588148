//! Error types for posthoc-ema-rs.
//!
//! All fallible operations in this crate return [`Result`], an alias over
//! [`EmaError`]. Construction-time problems surface as [`EmaError::Config`],
//! synthesis-time problems as [`EmaError::Synthesis`], and strict state
//! loading reports the offending entry through [`EmaError::StateMismatch`].

use thiserror::Error;

/// Result type alias for posthoc-ema-rs operations.
pub type Result<T> = std::result::Result<T, EmaError>;

/// Errors that can occur while tracking or synthesizing EMA state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EmaError {
    /// Invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized.
    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Checkpoint write, scan, or prune failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Synthesis cannot proceed with the available checkpoint history.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// A state entry does not structurally match the target model.
    #[error("state mismatch for {name}: expected {expected}, got {got}")]
    StateMismatch {
        /// Parameter name that failed to load.
        name: String,
        /// Expected structure (shape or presence) on the target model.
        expected: String,
        /// Structure actually found in the state being loaded.
        got: String,
    },

    /// Tensor operation failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmaError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a synthesis error.
    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    /// Create a state mismatch error.
    pub fn state_mismatch(
        name: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::StateMismatch {
            name: name.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_display() {
        let error = EmaError::config("sigma_rels must not be empty");
        assert_eq!(
            error.to_string(),
            "configuration error: sigma_rels must not be empty"
        );
    }

    #[test]
    fn test_checkpoint_error_display() {
        let error = EmaError::checkpoint("write failed for profile 1");
        assert_eq!(
            error.to_string(),
            "checkpoint error: write failed for profile 1"
        );
    }

    #[test]
    fn test_synthesis_error_display() {
        let error = EmaError::synthesis("no checkpoints found");
        assert_eq!(error.to_string(), "synthesis error: no checkpoints found");
    }

    #[test]
    fn test_state_mismatch_display() {
        let error = EmaError::state_mismatch("layer.weight", "[4, 8]", "[8, 4]");
        assert_eq!(
            error.to_string(),
            "state mismatch for layer.weight: expected [4, 8], got [8, 4]"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: EmaError = io_error.into();
        assert!(matches!(error, EmaError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((4, 5), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: EmaError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: EmaError = io_error.into();
        assert!(error.source().is_some());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<u64> {
            Ok(7)
        }

        fn returns_error() -> Result<u64> {
            Err(EmaError::config("bad"))
        }

        assert!(returns_result().is_ok());
        assert!(returns_error().is_err());
    }
}
