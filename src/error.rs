//! Error types for the quantization and checkpoint lifecycle engine
//!
//! Errors fall into four families:
//! - Configuration errors (`UnsupportedCombination`, `UnsupportedQuantizationMode`,
//!   `InconsistentBias`, `InvalidConfiguration`) — raised before any weight is
//!   mutated, so a failing call leaves the model untouched.
//! - Structural errors (`ShardMissing`, `ParameterShapeMismatch`, `NotFound`,
//!   `FormatError`) — raised during checkpoint load or module lookup.
//! - Resource errors (`IoError`, `InvalidShape`) — surfaced fatal, never retried.
//! - Sequencing errors (`PrematureActivation`, `AlreadyQuantized`) — precondition
//!   violations; sequencing is the caller's responsibility.

use thiserror::Error;

/// Result type alias for empacar operations
pub type Result<T> = std::result::Result<T, EmpacarError>;

/// Error type for quantization, replacement, and checkpoint operations
#[derive(Debug, Error)]
pub enum EmpacarError {
    /// Packing format and kernel options cannot be combined
    #[error("Unsupported combination: {format} with {requested}: {reason}")]
    UnsupportedCombination {
        /// Requested packing format
        format: String,
        /// Conflicting option
        requested: String,
        /// Why the combination is rejected
        reason: String,
    },

    /// Only zero-point (asymmetric) quantization is supported
    #[error("Unsupported quantization mode: {reason}")]
    UnsupportedQuantizationMode {
        /// Why the mode is rejected
        reason: String,
    },

    /// Q/K/V projections disagree on bias presence
    #[error("Inconsistent QKV bias: {reason}")]
    InconsistentBias {
        /// Which projections have and lack a bias
        reason: String,
    },

    /// Named module does not exist in the layer
    #[error("Module not found: '{name}'")]
    NotFound {
        /// Dotted module name that was requested
        name: String,
    },

    /// A manifest-referenced shard file is absent on disk
    #[error("Shard file missing: '{filename}' referenced by manifest")]
    ShardMissing {
        /// Shard filename from the manifest
        filename: String,
    },

    /// A loaded tensor's shape disagrees with the pre-allocated module
    #[error("Parameter shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ParameterShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape expected by the pre-allocated module
        expected: Vec<usize>,
        /// Shape found in the shard
        actual: Vec<usize>,
    },

    /// Post-init activation invoked before checkpoint load
    #[error("Premature activation: {reason}")]
    PrematureActivation {
        /// Which precondition was violated
        reason: String,
    },

    /// Replacement driver run on an already-quantized model
    #[error("Model is already quantized: {reason}")]
    AlreadyQuantized {
        /// Context for the repeated run
        reason: String,
    },

    /// Tensor shape is invalid for the operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Why the shape is invalid
        reason: String,
    },

    /// Checkpoint or config file is malformed
    #[error("Format error: {reason}")]
    FormatError {
        /// Why parsing failed
        reason: String,
    },

    /// Filesystem operation failed
    #[error("I/O error: {message}")]
    IoError {
        /// Underlying error description
        message: String,
    },

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration is rejected
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_combination_display() {
        let err = EmpacarError::UnsupportedCombination {
            format: "gemv".to_string(),
            requested: "exllama".to_string(),
            reason: "bandwidth-optimized kernels have no secondary-handle path".to_string(),
        };
        assert!(err.to_string().contains("gemv"));
        assert!(err.to_string().contains("exllama"));
    }

    #[test]
    fn test_shard_missing_display() {
        let err = EmpacarError::ShardMissing {
            filename: "model-00002-of-00004.safetensors".to_string(),
        };
        assert!(err.to_string().contains("model-00002-of-00004.safetensors"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = EmpacarError::ParameterShapeMismatch {
            name: "layers.0.mlp.up_proj.weight".to_string(),
            expected: vec![32, 8],
            actual: vec![8, 32],
        };
        let msg = err.to_string();
        assert!(msg.contains("layers.0.mlp.up_proj.weight"));
        assert!(msg.contains("[32, 8]"));
        assert!(msg.contains("[8, 32]"));
    }

    #[test]
    fn test_premature_activation_display() {
        let err = EmpacarError::PrematureActivation {
            reason: "weights not loaded".to_string(),
        };
        assert!(err.to_string().contains("Premature activation"));
    }
}
