//! Post-load kernel activation
//!
//! The Exllama family of packed kernels needs a second initialization pass
//! after every shard is in place: the packed tensors are re-ordered into the
//! kernel's native layout through a per-model handle, and the V2 kernel
//! additionally reserves a temporary workspace sized for the largest
//! projection it will run.
//!
//! Activation is strictly ordered after checkpoint load. Running it on a
//! model with unmaterialized weights fails with `PrematureActivation`, and
//! the workspace is only allocated after every guard has passed, so a failed
//! activation never leaves scratch memory behind.

use tracing::info;

use crate::error::{EmpacarError, Result};
use crate::module::{Model, Module};
use crate::registry::{KernelSpec, PackingFormat};

/// Workspace sizing for V2 activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostInitOptions {
    /// Largest batch the kernel will see
    pub max_batch_size: usize,
    /// Largest input length; defaults to the model's configured maximum
    pub max_input_len: Option<usize>,
}

impl Default for PostInitOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            max_input_len: None,
        }
    }
}

/// Temporary workspace reserved for the V2 kernel
#[derive(Debug, Clone, PartialEq)]
pub struct Scratch {
    /// Row capacity (`max_batch_size * max_input_len`)
    pub rows: usize,
    /// Column capacity (widest projection output)
    pub cols: usize,
    buffer: Vec<u16>,
}

impl Scratch {
    fn reserve(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            buffer: vec![0; rows * cols],
        }
    }

    /// Workspace size in bytes (f16 elements)
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.buffer.len() * 2
    }
}

/// Per-model secondary kernel handle
#[derive(Debug, Clone, PartialEq)]
pub struct KernelHandle {
    /// Format the handle was initialized for
    pub format: PackingFormat,
    /// V2 workspace; `None` for the V1 kernel
    pub scratch: Option<Scratch>,
}

/// Widest output dimension among the model's packed projections
fn widest_packed_output(model: &Model) -> usize {
    let mut widest = 0;
    for layer in &model.layers {
        for (_, module) in layer.iter() {
            match module {
                Module::Quantized(q) => widest = widest.max(q.out_features),
                Module::FusedAttention(f) => {
                    for inner in [f.qkv_proj(), f.o_proj()] {
                        if let Module::Quantized(q) = inner {
                            widest = widest.max(q.out_features);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    widest
}

/// Initialize the secondary kernel handle for a loaded model
///
/// Returns `None` for formats that are complete after packing. For the
/// Exllama formats, returns a handle; the V2 handle additionally carries a
/// scratch workspace of `max_batch_size * max_input_len` rows by the widest
/// packed output dimension.
///
/// All guards run before any allocation.
///
/// # Errors
///
/// - `PrematureActivation` when the model has unmaterialized weights or was
///   never run through the replacement driver
/// - `InvalidConfiguration` for a zero batch size or input length
pub fn post_init(
    model: &Model,
    spec: &KernelSpec,
    options: &PostInitOptions,
) -> Result<Option<KernelHandle>> {
    if !spec.format.requires_post_init() {
        return Ok(None);
    }
    if !model.is_quantized {
        return Err(EmpacarError::PrematureActivation {
            reason: "Model has not been quantized".to_string(),
        });
    }
    if !model.is_fully_materialized() {
        return Err(EmpacarError::PrematureActivation {
            reason: "Model weights are not fully loaded".to_string(),
        });
    }

    let scratch = match spec.format {
        PackingFormat::ExllamaV2 => {
            let max_input_len = options.max_input_len.unwrap_or(model.config.max_seq_len);
            if options.max_batch_size == 0 || max_input_len == 0 {
                return Err(EmpacarError::InvalidConfiguration {
                    reason: format!(
                        "Scratch sizing needs positive dimensions, got batch {} x len {}",
                        options.max_batch_size, max_input_len
                    ),
                });
            }
            let rows = options.max_batch_size * max_input_len;
            let cols = widest_packed_output(model);
            let scratch = Scratch::reserve(rows, cols);
            info!(
                rows,
                cols,
                bytes = scratch.byte_len(),
                "reserved kernel workspace"
            );
            Some(scratch)
        }
        _ => None,
    };

    info!(format = spec.format.as_str(), "kernel handle initialized");
    Ok(Some(KernelHandle {
        format: spec.format,
        scratch,
    }))
}
