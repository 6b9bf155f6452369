//! Layer-graph replacement driver
//!
//! Walks the model's transformer blocks and swaps each full-precision
//! projection for its packed low-bit counterpart in place. Per layer, the
//! driver steps through a fixed state sequence:
//!
//! ```text
//! Pending(i) -> FusingAttention -> ScalingActivations -> EnumeratingLinears
//!            -> PackingEach(j)* -> ReclaimingMemory -> Pending(i+1) ... -> Done
//! ```
//!
//! `FusingAttention` runs only for formats that pack a fused QKV projection.
//! Each layer's full-precision tensors are read once and dropped when their
//! slot is overwritten, so peak extra memory is roughly one layer's
//! full-precision footprint, never the whole model's.
//!
//! The driver is not idempotent: running it twice on the same model is
//! rejected up front via the model's `is_quantized` flag.

use tracing::{debug, info};

use crate::config::QuantConfig;
use crate::error::{EmpacarError, Result};
use crate::fused::assemble_fused_attention;
use crate::module::{exclude_linears, ActivationKind, Model, Module, ScaledActivation};
use crate::pack::{GroupQuantizer, QuantizedProjection};
use crate::registry::{select, HardwareFacts, KernelRequest, KernelSpec};

/// Whether the driver packs real weights or allocates shape-only modules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialization {
    /// Pack full-precision weights into real quantized buffers
    Pack,
    /// Allocate shape-only quantized buffers to be filled from shards
    EmptyWeights,
}

/// Driver state, advanced layer by layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementState {
    /// About to process layer `i`
    Pending(usize),
    /// Merging Q/K/V projections of layer `i` (fused-QKV formats only)
    FusingAttention(usize),
    /// Wrapping scale-sensitive activations of layer `i`
    ScalingActivations(usize),
    /// Building the filtered index of layer `i`'s linears
    EnumeratingLinears(usize),
    /// Packing linear `j` of layer `i`
    PackingEach {
        /// Layer index
        layer: usize,
        /// Linear index within the layer's filtered enumeration
        linear: usize,
    },
    /// Dropping layer `i`'s transient full-precision buffers
    ReclaimingMemory(usize),
    /// All layers processed
    Done,
}

/// Replacement run parameters
#[derive(Debug, Clone)]
pub struct ReplacementOptions<'a> {
    /// Quantization recipe
    pub quant_config: &'a QuantConfig,
    /// Kernel request (format plus load-time overrides)
    pub request: KernelRequest,
    /// Detected hardware facts
    pub hardware: &'a HardwareFacts,
    /// Pack real weights or allocate shape-only modules
    pub mode: Materialization,
}

/// Replace every eligible projection in the model with a packed module
///
/// Preconditions are validated before any mutation: the quantization recipe
/// (zero-point mode, bit width), the format/hardware combination, and — per
/// layer, before its `PackingEach` loop — QKV bias consistency for fused
/// formats. Returns the selected kernel spec for downstream post-init.
///
/// # Errors
///
/// - `AlreadyQuantized` when the model's guard flag is set
/// - `UnsupportedQuantizationMode` / `InvalidConfiguration` from recipe
///   validation
/// - `UnsupportedCombination` from kernel selection
/// - `InconsistentBias`, `InvalidShape`, `NotFound` from per-layer work
pub fn run_replacement(
    model: &mut Model,
    options: &ReplacementOptions<'_>,
    quantizer: &dyn GroupQuantizer,
) -> Result<KernelSpec> {
    if model.is_quantized {
        return Err(EmpacarError::AlreadyQuantized {
            reason: "replacement driver already ran on this model".to_string(),
        });
    }
    options.quant_config.validate()?;
    let spec = select(&options.request, options.hardware)?;

    info!(
        format = spec.format.as_str(),
        layers = model.layers.len(),
        "replacing layers"
    );

    let num_layers = model.layers.len();
    let w_bit = options.quant_config.w_bit;
    let group_size = options.quant_config.q_group_size;
    let mut state = ReplacementState::Pending(0);
    // Filtered linear names of the layer being packed, snapshotted once per
    // layer: packing shrinks the live enumeration, so indexing must run
    // against this stable list
    let mut linears: Vec<String> = Vec::new();

    loop {
        state = match state {
            ReplacementState::Pending(i) if i >= num_layers => ReplacementState::Done,
            ReplacementState::Pending(i) => {
                if spec.format.requires_fused_qkv() {
                    ReplacementState::FusingAttention(i)
                } else {
                    ReplacementState::ScalingActivations(i)
                }
            }
            ReplacementState::FusingAttention(i) => {
                let config = model.config.clone();
                assemble_fused_attention(&mut model.layers[i], "self_attn", &config)?;
                ReplacementState::ScalingActivations(i)
            }
            ReplacementState::ScalingActivations(i) => {
                scale_activations(model, i)?;
                ReplacementState::EnumeratingLinears(i)
            }
            ReplacementState::EnumeratingLinears(i) => {
                let named = model.layers[i].named_linears();
                linears = exclude_linears(named, &options.quant_config.modules_to_not_convert)
                    .into_iter()
                    .map(|(n, _)| n)
                    .collect();
                ReplacementState::PackingEach { layer: i, linear: 0 }
            }
            ReplacementState::PackingEach { layer, linear } => {
                if linear >= linears.len() {
                    ReplacementState::ReclaimingMemory(layer)
                } else {
                    let name = &linears[linear];
                    let device = model.layers[layer].device;
                    let projection =
                        model.layers[layer]
                            .get_dense(name)
                            .ok_or_else(|| EmpacarError::NotFound {
                                name: name.clone(),
                            })?;

                    let quantized = match options.mode {
                        Materialization::Pack => {
                            let params =
                                quantizer.quantize(name, projection, w_bit, group_size)?;
                            QuantizedProjection::from_dense(
                                projection, &params, w_bit, spec, device,
                            )?
                        }
                        Materialization::EmptyWeights => {
                            let mut empty = QuantizedProjection::empty(
                                projection.in_features,
                                projection.out_features,
                                w_bit,
                                group_size,
                                projection.bias.is_some(),
                                spec,
                            )?;
                            empty.device = device;
                            empty
                        }
                    };
                    debug!(layer, name = name.as_str(), "packed linear");
                    model.layers[layer]
                        .set_module_by_name(name, Module::Quantized(quantized))?;
                    ReplacementState::PackingEach {
                        layer,
                        linear: linear + 1,
                    }
                }
            }
            ReplacementState::ReclaimingMemory(i) => {
                // Replaced slots already dropped their full-precision tensors;
                // nothing else to free, but the state marks the per-layer
                // memory boundary for the peak-footprint invariant.
                debug!(layer = i, "layer reclaimed");
                ReplacementState::Pending(i + 1)
            }
            ReplacementState::Done => break,
        };
    }

    model.is_quantized = true;
    Ok(spec)
}

/// Wrap scale-sensitive activations so calibration scales can be folded later
fn scale_activations(model: &mut Model, layer_idx: usize) -> Result<()> {
    let layer = &mut model.layers[layer_idx];
    let targets: Vec<(String, ActivationKind, usize)> = layer
        .iter()
        .filter_map(|(name, module)| match module {
            Module::Activation(a) => a.scale_shape.map(|s| (name.to_string(), a.kind, s)),
            _ => None,
        })
        .collect();

    for (name, kind, shape) in targets {
        let wrapped = ScaledActivation::identity(kind, shape)?;
        layer.set_module_by_name(&name, Module::ScaledActivation(wrapped))?;
    }
    Ok(())
}
