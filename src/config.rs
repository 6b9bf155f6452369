//! Model topology facts and quantization configuration
//!
//! Two configuration surfaces feed the replacement engine:
//!
//! - [`ModelConfig`]: topology facts (hidden size, head counts, rotary base,
//!   maximum sequence length) consumed by the fused-attention assembler and
//!   post-init scratch sizing.
//! - [`QuantConfig`]: the quantization recipe (bit width, group size, packing
//!   format, zero-point mode, excluded module names), persisted next to the
//!   checkpoint shards as `quant_config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EmpacarError, Result};
use crate::registry::PackingFormat;

/// Filename for the persisted model topology config
pub const MODEL_CONFIG_FILENAME: &str = "config.json";

/// Filename for the persisted quantization config
pub const QUANT_CONFIG_FILENAME: &str = "quant_config.json";

/// Filename for the optional vision processor config
pub const PROCESSOR_CONFIG_FILENAME: &str = "processor_config.json";

/// Default maximum generation length when the source config carries none
pub const DEFAULT_MAX_SEQ_LEN: usize = 2048;

/// Transformer topology facts consumed by the replacement engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden dimension of the residual stream
    pub hidden_size: usize,
    /// Intermediate dimension of the MLP block
    pub intermediate_size: usize,
    /// Number of attention heads
    pub num_attention_heads: usize,
    /// Number of key/value heads (grouped-query attention)
    pub num_key_value_heads: usize,
    /// Number of transformer blocks
    pub num_hidden_layers: usize,
    /// Rotary embedding base frequency
    pub rope_theta: f32,
    /// Maximum sequence length for generation and scratch sizing
    pub max_seq_len: usize,
}

impl ModelConfig {
    /// Dimension of a single attention head
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `hidden_size` is not divisible by
    /// `num_attention_heads`.
    pub fn head_dim(&self) -> Result<usize> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(EmpacarError::InvalidConfiguration {
                reason: format!(
                    "hidden_size {} not divisible by num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                ),
            });
        }
        Ok(self.hidden_size / self.num_attention_heads)
    }

    /// Output dimension of the key/value projections
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on an inconsistent head layout.
    pub fn kv_dim(&self) -> Result<usize> {
        Ok(self.head_dim()? * self.num_key_value_heads)
    }

    /// Validate internal consistency
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on zero dimensions or head-count
    /// disagreements.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.num_hidden_layers == 0 {
            return Err(EmpacarError::InvalidConfiguration {
                reason: "hidden_size and num_hidden_layers must be > 0".to_string(),
            });
        }
        if self.num_key_value_heads > self.num_attention_heads {
            return Err(EmpacarError::InvalidConfiguration {
                reason: format!(
                    "num_key_value_heads {} exceeds num_attention_heads {}",
                    self.num_key_value_heads, self.num_attention_heads
                ),
            });
        }
        self.head_dim()?;
        Ok(())
    }

    /// Save as `config.json` inside `dir`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MODEL_CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(|e| EmpacarError::FormatError {
            reason: format!("Failed to serialize model config: {e}"),
        })?;
        std::fs::write(&path, json).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to write '{}': {e}", path.display()),
        })
    }

    /// Load `config.json` from `dir`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file is absent or unreadable and
    /// `FormatError` if the JSON is malformed.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MODEL_CONFIG_FILENAME);
        let content = std::fs::read_to_string(&path).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to read '{}': {e}", path.display()),
        })?;
        serde_json::from_str(&content).map_err(|e| EmpacarError::FormatError {
            reason: format!("Failed to parse '{}': {e}", path.display()),
        })
    }
}

/// Quantization recipe persisted alongside a quantized checkpoint
///
/// Serialized as `quant_config.json` in the checkpoint directory so a later
/// `from_quantized` load can rebuild the exact module topology without the
/// original full-precision model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Weight bit width (commonly 4)
    pub w_bit: u32,
    /// Group size for group-wise scales/zero-points (commonly 128)
    pub q_group_size: usize,
    /// Active packing format for the whole model
    pub version: PackingFormat,
    /// Whether zero-point (asymmetric) quantization is used.
    /// Only `true` is supported.
    pub zero_point: bool,
    /// Module name fragments excluded from quantization
    #[serde(default)]
    pub modules_to_not_convert: Vec<String>,
}

impl QuantConfig {
    /// Create a config with the common defaults (4-bit, group 128, zero-point)
    #[must_use]
    pub fn new(version: PackingFormat) -> Self {
        Self {
            w_bit: 4,
            q_group_size: 128,
            version,
            zero_point: true,
            modules_to_not_convert: Vec::new(),
        }
    }

    /// Validate the recipe before any weight mutation
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedQuantizationMode` for symmetric (non-zero-point)
    /// requests and `InvalidConfiguration` for unsupported bit widths or a
    /// zero group size.
    pub fn validate(&self) -> Result<()> {
        if !self.zero_point {
            return Err(EmpacarError::UnsupportedQuantizationMode {
                reason: "only zero-point (asymmetric) quantization is supported".to_string(),
            });
        }
        if self.w_bit == 0 || self.w_bit > 8 || 32 % self.w_bit != 0 {
            return Err(EmpacarError::InvalidConfiguration {
                reason: format!("unsupported weight bit width {}", self.w_bit),
            });
        }
        if self.q_group_size == 0 {
            return Err(EmpacarError::InvalidConfiguration {
                reason: "q_group_size must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Save as `quant_config.json` inside `dir`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(QUANT_CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(|e| EmpacarError::FormatError {
            reason: format!("Failed to serialize quant config: {e}"),
        })?;
        std::fs::write(&path, json).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to write '{}': {e}", path.display()),
        })
    }

    /// Load `quant_config.json` from `dir`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file is absent or unreadable and
    /// `FormatError` if the JSON is malformed.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(QUANT_CONFIG_FILENAME);
        let content = std::fs::read_to_string(&path).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to read '{}': {e}", path.display()),
        })?;
        serde_json::from_str(&content).map_err(|e| EmpacarError::FormatError {
            reason: format!("Failed to parse '{}': {e}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model_config() -> ModelConfig {
        ModelConfig {
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: 2,
            num_hidden_layers: 2,
            rope_theta: 10000.0,
            max_seq_len: 2048,
        }
    }

    #[test]
    fn test_head_dim() {
        let config = tiny_model_config();
        assert_eq!(config.head_dim().expect("head_dim"), 4);
        assert_eq!(config.kv_dim().expect("kv_dim"), 8);
    }

    #[test]
    fn test_head_dim_indivisible() {
        let mut config = tiny_model_config();
        config.num_attention_heads = 3;
        assert!(config.head_dim().is_err());
    }

    #[test]
    fn test_validate_rejects_kv_heads_exceeding_heads() {
        let mut config = tiny_model_config();
        config.num_key_value_heads = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quant_config_defaults() {
        let config = QuantConfig::new(PackingFormat::Gemm);
        assert_eq!(config.w_bit, 4);
        assert_eq!(config.q_group_size, 128);
        assert!(config.zero_point);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quant_config_rejects_symmetric() {
        let mut config = QuantConfig::new(PackingFormat::Gemm);
        config.zero_point = false;
        let err = config.validate().expect_err("must reject");
        assert!(matches!(
            err,
            EmpacarError::UnsupportedQuantizationMode { .. }
        ));
    }

    #[test]
    fn test_quant_config_rejects_odd_bit_width() {
        let mut config = QuantConfig::new(PackingFormat::Gemm);
        config.w_bit = 3;
        assert!(config.validate().is_err());
        config.w_bit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quant_config_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut config = QuantConfig::new(PackingFormat::Quick);
        config.modules_to_not_convert = vec!["lm_head".to_string()];

        config.save(dir.path()).expect("save");
        let loaded = QuantConfig::load(dir.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_model_config_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let config = tiny_model_config();
        config.save(dir.path()).expect("save");
        let loaded = ModelConfig::load(dir.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_quant_config_load_missing() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let result = QuantConfig::load(dir.path());
        assert!(matches!(result, Err(EmpacarError::IoError { .. })));
    }
}
