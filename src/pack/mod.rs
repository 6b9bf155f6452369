//! Quantized kernel builder: group-wise parameterization and bit-packing
//!
//! Converts a full-precision projection into a packed low-bit kernel module.
//! The packed layout is shared by every kernel family:
//!
//! - `qweight`: `[out_features, in_features / pack_factor]` u32 words, each
//!   holding `32 / w_bit` quantized values packed along the input dimension
//! - `qzeros`: `[out_features, ceil(n_groups / pack_factor)]` u32 words of
//!   packed per-group zero points
//! - `scales`: `[out_features, n_groups]` half-precision per-group scales
//!
//! Dequantization: `w = (q - z) * s` with `q` and `z` unsigned `w_bit`
//! integers and `s` the group's scale. Only zero-point (asymmetric)
//! quantization is supported; a symmetric request fails before any packing
//! work begins.

use rayon::prelude::*;

use crate::dispatch::Device;
use crate::error::{EmpacarError, Result};
use crate::registry::KernelSpec;
use crate::tensor::{Dtype, Tensor};


/// Full-precision linear projection: `weight [out, in]`, optional `bias [out]`
///
/// Source representation for packing. Read once, then released by the
/// replacement driver's reclaim step.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseProjection {
    /// Input feature count
    pub in_features: usize,
    /// Output feature count
    pub out_features: usize,
    /// Weight matrix `[out_features, in_features]`, row-major
    pub weight: Tensor,
    /// Optional bias `[out_features]`
    pub bias: Option<Tensor>,
}

impl DenseProjection {
    /// Create a projection from a weight tensor and optional bias
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the weight is not 2-D or the bias length
    /// does not equal `out_features`.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(EmpacarError::InvalidShape {
                reason: format!("Projection weight must be 2-D, got {:?}", weight.shape()),
            });
        }
        let out_features = weight.shape()[0];
        let in_features = weight.shape()[1];
        if let Some(b) = &bias {
            if b.shape() != [out_features] {
                return Err(EmpacarError::InvalidShape {
                    reason: format!(
                        "Bias shape {:?} does not match out_features {out_features}",
                        b.shape()
                    ),
                });
            }
        }
        Ok(Self {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    /// Shape-only projection for empty-weight materialization
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for zero dimensions.
    pub fn empty(in_features: usize, out_features: usize, with_bias: bool) -> Result<Self> {
        let weight = Tensor::empty(vec![out_features, in_features], Dtype::F32)?;
        let bias = if with_bias {
            Some(Tensor::empty(vec![out_features], Dtype::F32)?)
        } else {
            None
        };
        Ok(Self {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    /// Apply the linear transform to input `[n, in]` or `[in]`
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on dimension disagreement or unmaterialized
    /// weights.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (rows, input_data) = check_input(input, self.in_features)?;
        let weight = self.weight.as_f32()?;
        let bias = self.bias.as_ref().map(|b| b.as_f32()).transpose()?;

        let mut out = vec![0.0f32; rows * self.out_features];
        for r in 0..rows {
            let x = &input_data[r * self.in_features..(r + 1) * self.in_features];
            for o in 0..self.out_features {
                let w = &weight[o * self.in_features..(o + 1) * self.in_features];
                let mut acc: f32 = w.iter().zip(x).map(|(a, b)| a * b).sum();
                if let Some(b) = bias {
                    acc += b[o];
                }
                out[r * self.out_features + o] = acc;
            }
        }
        output_tensor(input, rows, self.out_features, out)
    }
}

/// Per-group scale and zero-point parameters for one projection
///
/// Produced either by the calibration collaborator (activation-aware search)
/// or by the built-in min/max fallback. Groups run along the input dimension;
/// the final group covers any remainder when `in_features` is not a multiple
/// of the group size.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationParameters {
    /// Per-group scales, row-major `[out_features, n_groups]`
    pub scales: Vec<f32>,
    /// Per-group integer zero points, row-major `[out_features, n_groups]`
    pub zeros: Vec<u32>,
    /// Group size along the input dimension
    pub group_size: usize,
    /// Whether these are zero-point (asymmetric) parameters
    pub zero_point: bool,
}

/// Number of scale/zero groups covering `in_features`
#[must_use]
pub fn group_count(in_features: usize, group_size: usize) -> usize {
    in_features.div_ceil(group_size)
}

impl QuantizationParameters {
    /// Compute min/max asymmetric parameters from the weight itself
    ///
    /// This is the calibration-free fallback; an activation-aware quantizer
    /// supplies better parameters through the [`GroupQuantizer`] trait.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on unmaterialized weights.
    pub fn from_weight(projection: &DenseProjection, w_bit: u32, group_size: usize) -> Result<Self> {
        let weight = projection.weight.as_f32()?;
        let (out, inf) = (projection.out_features, projection.in_features);
        let n_groups = group_count(inf, group_size);
        let max_q = (1u32 << w_bit) - 1;

        let mut scales = vec![0.0f32; out * n_groups];
        let mut zeros = vec![0u32; out * n_groups];

        for o in 0..out {
            let row = &weight[o * inf..(o + 1) * inf];
            for g in 0..n_groups {
                let start = g * group_size;
                let end = (start + group_size).min(inf);
                let group = &row[start..end];

                let min = group.iter().copied().fold(f32::INFINITY, f32::min);
                let max = group.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let min = min.min(0.0);
                let max = max.max(0.0);

                #[allow(clippy::cast_precision_loss)]
                let scale = if (max - min).abs() < f32::EPSILON {
                    1.0
                } else {
                    (max - min) / max_q as f32
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let zero = (-min / scale).round().clamp(0.0, max_q as f32) as u32;

                scales[o * n_groups + g] = scale;
                zeros[o * n_groups + g] = zero;
            }
        }

        Ok(Self {
            scales,
            zeros,
            group_size,
            zero_point: true,
        })
    }

    fn validate_for(&self, projection: &DenseProjection) -> Result<()> {
        let n_groups = group_count(projection.in_features, self.group_size);
        let expected = projection.out_features * n_groups;
        if self.scales.len() != expected || self.zeros.len() != expected {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "Quantization parameters cover {} groups, projection needs {expected}",
                    self.scales.len()
                ),
            });
        }
        Ok(())
    }
}

/// Calibration collaborator: produces per-group parameters for a named linear
///
/// The activation-aware scale search lives behind this trait; the engine
/// consumes it as an opaque source of [`QuantizationParameters`].
pub trait GroupQuantizer {
    /// Produce parameters for one projection
    ///
    /// # Errors
    ///
    /// Implementations may fail on unmaterialized weights or calibration
    /// problems.
    fn quantize(
        &self,
        name: &str,
        projection: &DenseProjection,
        w_bit: u32,
        group_size: usize,
    ) -> Result<QuantizationParameters>;
}

/// Calibration-free quantizer using per-group min/max ranges
#[derive(Debug, Clone, Copy, Default)]
pub struct MinMaxQuantizer;

impl GroupQuantizer for MinMaxQuantizer {
    fn quantize(
        &self,
        _name: &str,
        projection: &DenseProjection,
        w_bit: u32,
        group_size: usize,
    ) -> Result<QuantizationParameters> {
        QuantizationParameters::from_weight(projection, w_bit, group_size)
    }
}

/// Packed low-bit kernel module
///
/// Shape-transparent replacement for a [`DenseProjection`]: logical input and
/// output feature counts equal the original's exactly, so the rest of the
/// model is format-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedProjection {
    /// Input feature count (logical, matches the replaced projection)
    pub in_features: usize,
    /// Output feature count (logical, matches the replaced projection)
    pub out_features: usize,
    /// Weight bit width
    pub w_bit: u32,
    /// Group size along the input dimension
    pub group_size: usize,
    /// Kernel family and split factors this module was built for
    pub kernel: KernelSpec,
    /// Packed quantized weights `[out, in / pack_factor]`
    pub qweight: Tensor,
    /// Packed per-group zero points `[out, ceil(n_groups / pack_factor)]`
    pub qzeros: Tensor,
    /// Per-group scales `[out, n_groups]`, half precision
    pub scales: Tensor,
    /// Optional bias `[out]`
    pub bias: Option<Tensor>,
    /// Device this module's parameters live on
    pub device: Device,
}

fn pack_factor(w_bit: u32) -> usize {
    (32 / w_bit) as usize
}

impl QuantizedProjection {
    /// Build a packed module from a full-precision projection
    ///
    /// # Arguments
    ///
    /// * `projection` - Source full-precision weights and bias
    /// * `params` - Per-group scale/zero-point parameters
    /// * `w_bit` - Target bit width
    /// * `kernel` - Kernel spec selected by the format registry
    /// * `device` - Device the surrounding layer's parameters live on
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedQuantizationMode` for non-zero-point parameters
    /// (checked before any packing work), and `InvalidShape` when
    /// `in_features` is not a multiple of the pack factor or the parameters
    /// do not cover the projection.
    pub fn from_dense(
        projection: &DenseProjection,
        params: &QuantizationParameters,
        w_bit: u32,
        kernel: KernelSpec,
        device: Device,
    ) -> Result<Self> {
        if !params.zero_point {
            return Err(EmpacarError::UnsupportedQuantizationMode {
                reason: "only zero-point (asymmetric) quantization is supported".to_string(),
            });
        }
        params.validate_for(projection)?;

        let pf = pack_factor(w_bit);
        let (out, inf) = (projection.out_features, projection.in_features);
        if inf % pf != 0 {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "in_features {inf} is not a multiple of the pack factor {pf} for {w_bit}-bit packing"
                ),
            });
        }

        let group_size = params.group_size;
        let n_groups = group_count(inf, group_size);
        let weight = projection.weight.as_f32()?;
        let max_q = (1u32 << w_bit) - 1;

        let words_per_row = inf / pf;
        let zero_words_per_row = n_groups.div_ceil(pf);
        let mut qweight = vec![0u32; out * words_per_row];
        let mut qzeros = vec![0u32; out * zero_words_per_row];

        // Rows pack independently
        qweight
            .par_chunks_mut(words_per_row)
            .zip(qzeros.par_chunks_mut(zero_words_per_row))
            .enumerate()
            .for_each(|(o, (wrow, zrow))| {
                let row = &weight[o * inf..(o + 1) * inf];
                for (j, &w) in row.iter().enumerate() {
                    let g = j / group_size;
                    let scale = params.scales[o * n_groups + g];
                    let zero = params.zeros[o * n_groups + g];
                    #[allow(clippy::cast_precision_loss)]
                    let q = ((w / scale).round() + zero as f32).clamp(0.0, max_q as f32);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let q = q as u32;
                    let shift = (j % pf) as u32 * w_bit;
                    wrow[j / pf] |= q << shift;
                }
                for g in 0..n_groups {
                    let z = params.zeros[o * n_groups + g] & max_q;
                    let shift = (g % pf) as u32 * w_bit;
                    zrow[g / pf] |= z << shift;
                }
            });

        let qweight = Tensor::from_u32(vec![out, words_per_row], qweight)?;
        let qzeros = Tensor::from_u32(vec![out, zero_words_per_row], qzeros)?;
        let scales = Tensor::from_f32_as_f16(vec![out, n_groups], &params.scales)?;

        Ok(Self {
            in_features: inf,
            out_features: out,
            w_bit,
            group_size,
            kernel,
            qweight,
            qzeros,
            scales,
            bias: projection.bias.clone(),
            device,
        })
    }

    /// Allocate a shape-only packed module (no storage)
    ///
    /// Mirrors the shapes `from_dense` would produce so checkpoint shards
    /// can be streamed into it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when `in_features` is not a multiple of the
    /// pack factor.
    pub fn empty(
        in_features: usize,
        out_features: usize,
        w_bit: u32,
        group_size: usize,
        with_bias: bool,
        kernel: KernelSpec,
    ) -> Result<Self> {
        let pf = pack_factor(w_bit);
        if in_features % pf != 0 {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "in_features {in_features} is not a multiple of the pack factor {pf}"
                ),
            });
        }
        let n_groups = group_count(in_features, group_size);
        let qweight = Tensor::empty(vec![out_features, in_features / pf], Dtype::U32)?;
        let qzeros = Tensor::empty(vec![out_features, n_groups.div_ceil(pf)], Dtype::U32)?;
        let scales = Tensor::empty(vec![out_features, n_groups], Dtype::F16)?;
        let bias = if with_bias {
            Some(Tensor::empty(vec![out_features], Dtype::F32)?)
        } else {
            None
        };
        Ok(Self {
            in_features,
            out_features,
            w_bit,
            group_size,
            kernel,
            qweight,
            qzeros,
            scales,
            bias,
            device: Device::Cpu,
        })
    }

    /// Whether every parameter buffer has real storage
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.qweight.is_materialized()
            && self.qzeros.is_materialized()
            && self.scales.is_materialized()
            && self.bias.as_ref().is_none_or(Tensor::is_materialized)
    }

    /// Dequantize one output row back to f32
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on unmaterialized buffers or a row index out
    /// of range.
    pub fn dequantize_row(&self, row: usize) -> Result<Vec<f32>> {
        if row >= self.out_features {
            return Err(EmpacarError::InvalidShape {
                reason: format!("Row {row} out of range for {} rows", self.out_features),
            });
        }
        let pf = pack_factor(self.w_bit);
        let max_q = (1u32 << self.w_bit) - 1;
        let n_groups = group_count(self.in_features, self.group_size);
        let words_per_row = self.in_features / pf;
        let zero_words_per_row = n_groups.div_ceil(pf);

        let qweight = self.qweight.as_u32()?;
        let qzeros = self.qzeros.as_u32()?;
        let scales = self.scales.to_f32_vec()?;

        let mut out = Vec::with_capacity(self.in_features);
        for j in 0..self.in_features {
            let word = qweight[row * words_per_row + j / pf];
            let q = (word >> ((j % pf) as u32 * self.w_bit)) & max_q;

            let g = j / self.group_size;
            let zword = qzeros[row * zero_words_per_row + g / pf];
            let z = (zword >> ((g % pf) as u32 * self.w_bit)) & max_q;
            let scale = scales[row * n_groups + g];

            #[allow(clippy::cast_precision_loss)]
            out.push((q as f32 - z as f32) * scale);
        }
        Ok(out)
    }

    /// Apply the linear transform to input `[n, in]` or `[in]`
    ///
    /// Dequantizing reference path; kernel-specific GEMM/GEMV inner loops
    /// are out of scope for this engine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on dimension disagreement or unmaterialized
    /// buffers.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (rows, input_data) = check_input(input, self.in_features)?;
        let bias = self.bias.as_ref().map(|b| b.as_f32()).transpose()?;

        let mut out = vec![0.0f32; rows * self.out_features];
        for o in 0..self.out_features {
            let w = self.dequantize_row(o)?;
            for r in 0..rows {
                let x = &input_data[r * self.in_features..(r + 1) * self.in_features];
                let mut acc: f32 = w.iter().zip(x).map(|(a, b)| a * b).sum();
                if let Some(b) = bias {
                    acc += b[o];
                }
                out[r * self.out_features + o] = acc;
            }
        }
        output_tensor(input, rows, self.out_features, out)
    }

    /// Named parameter tensors in deterministic iteration order
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(&'static str, &Tensor)> {
        let mut params = vec![
            ("qweight", &self.qweight),
            ("qzeros", &self.qzeros),
            ("scales", &self.scales),
        ];
        if let Some(bias) = &self.bias {
            params.push(("bias", bias));
        }
        params
    }

    /// Mutable named parameter tensors (checkpoint load path)
    pub fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        let mut params = vec![
            ("qweight", &mut self.qweight),
            ("qzeros", &mut self.qzeros),
            ("scales", &mut self.scales),
        ];
        if let Some(bias) = &mut self.bias {
            params.push(("bias", bias));
        }
        params
    }
}

/// Validate input shape, returning row count and data slice
fn check_input(input: &Tensor, in_features: usize) -> Result<(usize, &[f32])> {
    let shape = input.shape();
    let (rows, last) = match shape.len() {
        1 => (1, shape[0]),
        2 => (shape[0], shape[1]),
        _ => {
            return Err(EmpacarError::InvalidShape {
                reason: format!("Expected 1-D or 2-D input, got {shape:?}"),
            })
        }
    };
    if last != in_features {
        return Err(EmpacarError::InvalidShape {
            reason: format!("Input feature count {last} does not match in_features {in_features}"),
        });
    }
    Ok((rows, input.as_f32()?))
}

/// Build the output tensor preserving the input's dimensionality
fn output_tensor(input: &Tensor, rows: usize, out_features: usize, data: Vec<f32>) -> Result<Tensor> {
    if input.ndim() == 1 {
        Tensor::from_f32(vec![out_features], data)
    } else {
        Tensor::from_f32(vec![rows, out_features], data)
    }
}
