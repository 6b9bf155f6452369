//! # Empacar
//!
//! Quantized-module replacement and checkpoint lifecycle for transformer
//! models.
//!
//! Empacar (Spanish: "to pack") rewrites a full-precision transformer layer
//! graph into low-bit packed modules and manages the two checkpoint flows
//! around that rewrite: sharded save of a freshly quantized model, and
//! empty-topology load of an existing quantized checkpoint.
//!
//! ## Features
//!
//! - **In-place replacement**: each linear projection is swapped for its
//!   packed counterpart in its original slot, keeping parameter names stable
//! - **Five packing formats**: GEMM, GEMV, Exllama, ExllamaV2, and QUICK
//!   (fused QKV), selected per hardware through a small kernel registry
//! - **Sharded checkpoints**: greedy size-bounded binning with a
//!   safetensors-style layout and an index manifest
//! - **Deferred materialization**: shape-only tensors until shard data is
//!   streamed into placed modules
//!
//! ## Example
//!
//! ```rust
//! use empacar::config::{ModelConfig, QuantConfig};
//! use empacar::pack::MinMaxQuantizer;
//! use empacar::registry::{HardwareFacts, PackingFormat};
//! use empacar::QuantModel;
//!
//! let config = ModelConfig {
//!     hidden_size: 8,
//!     intermediate_size: 16,
//!     num_attention_heads: 2,
//!     num_key_value_heads: 2,
//!     num_hidden_layers: 1,
//!     rope_theta: 10_000.0,
//!     max_seq_len: 64,
//! };
//! let mut quant_config = QuantConfig::new(PackingFormat::Gemm);
//! quant_config.q_group_size = 4;
//!
//! let mut model = QuantModel::dense(&config, quant_config).unwrap();
//! // (weights would be loaded here; zero weights quantize fine)
//! model
//!     .quantize(&MinMaxQuantizer, &HardwareFacts::cpu_only())
//!     .unwrap();
//! assert!(model.model.is_quantized);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for quantization math is bounded
#![allow(clippy::cast_possible_truncation)] // packed-word arithmetic stays in range
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fused;
pub mod model;
pub mod module;
pub mod pack;
pub mod postinit;
pub mod registry;
pub mod replace;
pub mod tensor;

pub use error::{EmpacarError, Result};
pub use model::QuantModel;
pub use tensor::Tensor;
