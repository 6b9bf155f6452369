//! Fused-attention assembler for the Quick packing format
//!
//! The Quick kernel computes attention over a single fused QKV projection.
//! Before packing, the assembler algebraically merges a layer's separate
//! query/key/value projections into one `[out_q + out_k + out_v, in]`
//! projection and replaces the whole attention sub-block with a
//! [`FusedAttention`] module.
//!
//! The replaced block's rotary-embedding holder is not carried over: the
//! fused module manages its own rotary computation, so the new module simply
//! never owns that holder.

use crate::config::ModelConfig;
use crate::error::{EmpacarError, Result};
use crate::module::{Layer, Module};
use crate::pack::DenseProjection;
use crate::tensor::Tensor;

/// Per-head shape metadata carried by a fused attention module
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionShapes {
    /// Residual stream width
    pub hidden_size: usize,
    /// Number of attention heads
    pub n_heads: usize,
    /// Number of key/value heads
    pub n_kv_heads: usize,
    /// Dimension of one head
    pub head_dim: usize,
    /// Rotary base frequency
    pub rope_theta: f32,
    /// Maximum sequence length
    pub max_seq_len: usize,
}

impl AttentionShapes {
    /// Read shape metadata from the model configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on an inconsistent head layout.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            hidden_size: config.hidden_size,
            n_heads: config.num_attention_heads,
            n_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim()?,
            rope_theta: config.rope_theta,
            max_seq_len: config.max_seq_len,
        })
    }
}

/// Attention block with a single fused QKV projection
///
/// Owns the fused QKV projection and the output projection as module slots.
/// Both start dense and are packed in place by the replacement driver, which
/// reaches them through the layer index as `<entry>.qkv_proj` and
/// `<entry>.o_proj`.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedAttention {
    /// Shape metadata for the fused kernel
    pub shapes: AttentionShapes,
    qkv_proj: Box<Module>,
    o_proj: Box<Module>,
}

impl FusedAttention {
    /// Create a fused attention block from its two projections
    #[must_use]
    pub fn new(shapes: AttentionShapes, qkv_proj: DenseProjection, o_proj: Module) -> Self {
        Self {
            shapes,
            qkv_proj: Box::new(Module::Dense(qkv_proj)),
            o_proj: Box::new(o_proj),
        }
    }

    /// Borrow the fused QKV slot
    #[must_use]
    pub fn qkv_proj(&self) -> &Module {
        &self.qkv_proj
    }

    /// Borrow the output projection slot
    #[must_use]
    pub fn o_proj(&self) -> &Module {
        &self.o_proj
    }

    /// Inner projections that are still dense, as (slot name, projection)
    #[must_use]
    pub fn named_linears(&self) -> Vec<(&'static str, &DenseProjection)> {
        let mut out = Vec::new();
        if let Module::Dense(p) = self.qkv_proj.as_ref() {
            out.push(("qkv_proj", p));
        }
        if let Module::Dense(p) = self.o_proj.as_ref() {
            out.push(("o_proj", p));
        }
        out
    }

    /// Overwrite an inner slot by name
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for slot names other than `qkv_proj` / `o_proj`.
    pub fn set_inner(&mut self, name: &str, module: Module) -> Result<()> {
        match name {
            "qkv_proj" => {
                self.qkv_proj = Box::new(module);
                Ok(())
            }
            "o_proj" => {
                self.o_proj = Box::new(module);
                Ok(())
            }
            other => Err(EmpacarError::NotFound {
                name: other.to_string(),
            }),
        }
    }

    /// Named parameters of both inner slots, prefixed by slot name
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        for (slot, module) in [("qkv_proj", self.qkv_proj.as_ref()), ("o_proj", self.o_proj.as_ref())] {
            for (param, tensor) in module.named_parameters() {
                out.push((format!("{slot}.{param}"), tensor));
            }
        }
        out
    }

    /// Mutable named parameters of both inner slots
    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out = Vec::new();
        for (slot, module) in [
            ("qkv_proj", self.qkv_proj.as_mut()),
            ("o_proj", self.o_proj.as_mut()),
        ] {
            for (param, tensor) in module.named_parameters_mut() {
                out.push((format!("{slot}.{param}"), tensor));
            }
        }
        out
    }
}

fn dense_at<'a>(layer: &'a Layer, name: &str) -> Result<&'a DenseProjection> {
    match layer.get(name) {
        Some(Module::Dense(p)) => Ok(p),
        _ => Err(EmpacarError::NotFound {
            name: name.to_string(),
        }),
    }
}

/// Merge a layer's separate Q/K/V projections into one fused attention block
///
/// Validation happens before any mutation, so a failing call leaves the
/// layer untouched. On success the `<prefix>.*` entries (including the
/// rotary holder) are removed and a single `<prefix>` entry holding the
/// [`FusedAttention`] module takes the position of the first removed entry.
///
/// # Errors
///
/// - `NotFound` when any of the four projections is missing or not dense
/// - `InvalidShape` when Q/K/V disagree on `in_features`
/// - `InconsistentBias` when some but not all of Q/K/V carry a bias
pub fn assemble_fused_attention(
    layer: &mut Layer,
    prefix: &str,
    config: &ModelConfig,
) -> Result<()> {
    let shapes = AttentionShapes::from_config(config)?;

    let q = dense_at(layer, &format!("{prefix}.q_proj"))?;
    let k = dense_at(layer, &format!("{prefix}.k_proj"))?;
    let v = dense_at(layer, &format!("{prefix}.v_proj"))?;
    // Output projection presence is validated up front too
    dense_at(layer, &format!("{prefix}.o_proj"))?;

    if q.in_features != k.in_features || q.in_features != v.in_features {
        return Err(EmpacarError::InvalidShape {
            reason: format!(
                "Q/K/V in_features disagree: {}, {}, {}",
                q.in_features, k.in_features, v.in_features
            ),
        });
    }

    let bias_flags = [q.bias.is_some(), k.bias.is_some(), v.bias.is_some()];
    let with_bias = match bias_flags {
        [true, true, true] => true,
        [false, false, false] => false,
        _ => {
            return Err(EmpacarError::InconsistentBias {
                reason: format!(
                    "bias presence differs across projections (q={}, k={}, v={})",
                    bias_flags[0], bias_flags[1], bias_flags[2]
                ),
            })
        }
    };

    let in_features = q.in_features;
    let out_features = q.out_features + k.out_features + v.out_features;

    let materialized = [q, k, v]
        .iter()
        .filter(|p| p.weight.is_materialized())
        .count();
    let fused_qkv = match materialized {
        // Empty-weight topology: shape arithmetic only, storage comes from shards
        0 => DenseProjection::empty(in_features, out_features, with_bias)?,
        3 => {
            let mut weight = Vec::with_capacity(out_features * in_features);
            for proj in [q, k, v] {
                weight.extend_from_slice(proj.weight.as_f32()?);
            }
            let weight = Tensor::from_f32(vec![out_features, in_features], weight)?;

            let bias = if with_bias {
                let mut data = Vec::with_capacity(out_features);
                for proj in [q, k, v] {
                    if let Some(b) = &proj.bias {
                        data.extend_from_slice(b.as_f32()?);
                    }
                }
                Some(Tensor::from_f32(vec![out_features], data)?)
            } else {
                None
            };
            DenseProjection::new(weight, bias)?
        }
        _ => {
            return Err(EmpacarError::InvalidShape {
                reason: "Q/K/V projections mix materialized and empty weights".to_string(),
            })
        }
    };

    // All validation passed; now mutate the layer in place
    let q_name = format!("{prefix}.q_proj");
    let position = layer
        .position(&q_name)
        .ok_or_else(|| EmpacarError::NotFound { name: q_name })?;
    let mut removed = layer.remove_prefix(prefix);

    let o_name = format!("{prefix}.o_proj");
    let o_idx = removed
        .iter()
        .position(|(n, _)| n == &o_name)
        .ok_or_else(|| EmpacarError::NotFound { name: o_name })?;
    let (_, o_proj) = removed.swap_remove(o_idx);
    // Remaining removed entries (q/k/v, rotary holder) are dropped here

    let fused = FusedAttention::new(shapes, fused_qkv, o_proj);
    layer.insert_at(position, prefix, Module::FusedAttention(fused));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::RotaryEmbedding;

    fn test_config() -> ModelConfig {
        ModelConfig {
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: 2,
            num_hidden_layers: 1,
            rope_theta: 10000.0,
            max_seq_len: 64,
        }
    }

    fn projection(out: usize, inf: usize, bias: bool) -> DenseProjection {
        #[allow(clippy::cast_precision_loss)]
        let weight: Vec<f32> = (0..out * inf).map(|i| i as f32 * 0.01).collect();
        let weight = Tensor::from_f32(vec![out, inf], weight).expect("weight");
        let bias = bias.then(|| Tensor::ones(vec![out]).expect("bias"));
        DenseProjection::new(weight, bias).expect("projection")
    }

    fn attention_layer(q_bias: bool, k_bias: bool, v_bias: bool) -> Layer {
        let mut layer = Layer::new();
        layer.push("self_attn.q_proj", Module::Dense(projection(8, 8, q_bias)));
        layer.push("self_attn.k_proj", Module::Dense(projection(8, 8, k_bias)));
        layer.push("self_attn.v_proj", Module::Dense(projection(8, 8, v_bias)));
        layer.push("self_attn.o_proj", Module::Dense(projection(8, 8, false)));
        layer.push(
            "self_attn.rotary_emb",
            Module::RotaryEmbedding(RotaryEmbedding {
                dim: 4,
                theta: 10000.0,
                max_seq_len: 64,
            }),
        );
        layer.push("mlp.up_proj", Module::Dense(projection(16, 8, false)));
        layer
    }

    #[test]
    fn test_assemble_concatenates_output_dims() {
        let mut layer = attention_layer(false, false, false);
        assemble_fused_attention(&mut layer, "self_attn", &test_config()).expect("assemble");

        let Some(Module::FusedAttention(fused)) = layer.get("self_attn") else {
            panic!("expected fused attention at self_attn");
        };
        let Module::Dense(qkv) = fused.qkv_proj() else {
            panic!("expected dense fused qkv");
        };
        assert_eq!(qkv.out_features, 24); // 8 + 8 + 8
        assert_eq!(qkv.in_features, 8);
        assert!(qkv.bias.is_none());
        assert_eq!(fused.shapes.n_heads, 2);
        assert_eq!(fused.shapes.n_kv_heads, 2);
    }

    #[test]
    fn test_assemble_takes_position_of_first_entry() {
        let mut layer = attention_layer(false, false, false);
        assemble_fused_attention(&mut layer, "self_attn", &test_config()).expect("assemble");
        assert_eq!(layer.names(), vec!["self_attn", "mlp.up_proj"]);
    }

    #[test]
    fn test_assemble_discards_rotary_holder() {
        let mut layer = attention_layer(false, false, false);
        assemble_fused_attention(&mut layer, "self_attn", &test_config()).expect("assemble");
        assert!(layer.get("self_attn.rotary_emb").is_none());
        // The fused module exposes only its two projection slots
        let Some(Module::FusedAttention(fused)) = layer.get("self_attn") else {
            panic!("expected fused attention");
        };
        let names: Vec<&str> = fused.named_linears().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["qkv_proj", "o_proj"]);
    }

    #[test]
    fn test_assemble_concatenates_biases() {
        let mut layer = attention_layer(true, true, true);
        assemble_fused_attention(&mut layer, "self_attn", &test_config()).expect("assemble");
        let Some(Module::FusedAttention(fused)) = layer.get("self_attn") else {
            panic!("expected fused attention");
        };
        let Module::Dense(qkv) = fused.qkv_proj() else {
            panic!("expected dense fused qkv");
        };
        let bias = qkv.bias.as_ref().expect("fused bias");
        assert_eq!(bias.shape(), &[24]);
    }

    #[test]
    fn test_assemble_inconsistent_bias_fails_without_mutation() {
        let mut layer = attention_layer(true, false, true);
        let before = layer.clone();
        let err = assemble_fused_attention(&mut layer, "self_attn", &test_config())
            .expect_err("must reject");
        assert!(matches!(err, EmpacarError::InconsistentBias { .. }));
        assert_eq!(layer, before);
    }

    #[test]
    fn test_assemble_missing_projection() {
        let mut layer = Layer::new();
        layer.push("self_attn.q_proj", Module::Dense(projection(8, 8, false)));
        let err = assemble_fused_attention(&mut layer, "self_attn", &test_config())
            .expect_err("must reject");
        assert!(matches!(err, EmpacarError::NotFound { .. }));
    }

    #[test]
    fn test_assemble_mismatched_in_features() {
        let mut layer = attention_layer(false, false, false);
        layer
            .set_module_by_name("self_attn.k_proj", Module::Dense(projection(8, 16, false)))
            .expect("replace");
        let err = assemble_fused_attention(&mut layer, "self_attn", &test_config())
            .expect_err("must reject");
        assert!(matches!(err, EmpacarError::InvalidShape { .. }));
    }

    #[test]
    fn test_fused_weight_is_concatenation() {
        let mut layer = attention_layer(false, false, false);
        let q = match layer.get("self_attn.q_proj") {
            Some(Module::Dense(p)) => p.weight.as_f32().expect("weight").to_vec(),
            _ => panic!("expected dense q_proj"),
        };
        assemble_fused_attention(&mut layer, "self_attn", &test_config()).expect("assemble");

        let Some(Module::FusedAttention(fused)) = layer.get("self_attn") else {
            panic!("expected fused attention");
        };
        let Module::Dense(qkv) = fused.qkv_proj() else {
            panic!("expected dense qkv");
        };
        let fused_weight = qkv.weight.as_f32().expect("weight");
        assert_eq!(&fused_weight[..q.len()], &q[..]);
    }
}
