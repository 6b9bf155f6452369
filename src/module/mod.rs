//! Named-module index: layers as ordered registries of tagged module variants
//!
//! A transformer block is a [`Layer`]: an ordered container of dotted-name →
//! [`Module`] entries. Replacement is a pure "lookup, construct new variant,
//! overwrite slot" operation — the new module keeps the replaced entry's name
//! and position, so checkpoint parameter names stay stable across
//! quantization.
//!
//! The index flattens to *leaf computational modules* only: dense and
//! quantized projections. A [`FusedAttention`](crate::fused::FusedAttention)
//! entry contributes its inner projections under `<name>.qkv_proj` and
//! `<name>.o_proj`.

use tracing::warn;

use crate::dispatch::Device;
use crate::error::{EmpacarError, Result};
use crate::fused::FusedAttention;
use crate::pack::{DenseProjection, QuantizedProjection};
use crate::tensor::Tensor;


/// Activation function kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Sigmoid-weighted linear unit (Llama family)
    Silu,
    /// Gaussian error linear unit (Falcon/MPT family)
    Gelu,
    /// Rectified linear unit
    Relu,
}

/// Activation function entry inside a layer
///
/// `scale_shape` marks the activation as scale-sensitive: calibration may
/// later fold a per-channel scale of that length in front of it, so the
/// replacement driver wraps it in a [`ScaledActivation`] before packing.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    /// Function kind
    pub kind: ActivationKind,
    /// Per-channel scale length when scale-sensitive, `None` otherwise
    pub scale_shape: Option<usize>,
}

/// Scale-carrying activation wrapper
///
/// Starts with identity scales; a later per-channel scale from calibration
/// can be folded in without re-touching the packed weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledActivation {
    /// Wrapped activation kind
    pub kind: ActivationKind,
    /// Per-channel scales `[scale_shape]`
    pub scales: Tensor,
}

impl ScaledActivation {
    /// Wrap an activation with identity scales
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for a zero scale length.
    pub fn identity(kind: ActivationKind, scale_shape: usize) -> Result<Self> {
        Ok(Self {
            kind,
            scales: Tensor::ones(vec![scale_shape])?,
        })
    }
}

/// Rotary positional-embedding holder
///
/// Pure metadata: the fused attention module manages its own rotary
/// computation, so fusing a layer drops this entry entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryEmbedding {
    /// Rotation dimension (head dim)
    pub dim: usize,
    /// Base frequency
    pub theta: f32,
    /// Maximum cached sequence length
    pub max_seq_len: usize,
}

/// Tagged module variant stored in a layer slot
#[derive(Debug, Clone, PartialEq)]
pub enum Module {
    /// Full-precision linear projection
    Dense(DenseProjection),
    /// Packed low-bit projection
    Quantized(QuantizedProjection),
    /// Plain activation function
    Activation(Activation),
    /// Scale-carrying activation wrapper
    ScaledActivation(ScaledActivation),
    /// Rotary positional-embedding holder
    RotaryEmbedding(RotaryEmbedding),
    /// Fused QKV attention block
    FusedAttention(FusedAttention),
}

impl Module {
    /// Named parameter tensors of this module, in deterministic order
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        match self {
            Module::Dense(p) => {
                let mut out = vec![("weight".to_string(), &p.weight)];
                if let Some(bias) = &p.bias {
                    out.push(("bias".to_string(), bias));
                }
                out
            }
            Module::Quantized(q) => q
                .named_parameters()
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
            Module::ScaledActivation(a) => vec![("scales".to_string(), &a.scales)],
            Module::Activation(_) | Module::RotaryEmbedding(_) => Vec::new(),
            Module::FusedAttention(f) => f.named_parameters(),
        }
    }

    /// Mutable named parameter tensors (checkpoint load path)
    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        match self {
            Module::Dense(p) => {
                let mut out = vec![("weight".to_string(), &mut p.weight)];
                if let Some(bias) = &mut p.bias {
                    out.push(("bias".to_string(), bias));
                }
                out
            }
            Module::Quantized(q) => q
                .named_parameters_mut()
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
            Module::ScaledActivation(a) => vec![("scales".to_string(), &mut a.scales)],
            Module::Activation(_) | Module::RotaryEmbedding(_) => Vec::new(),
            Module::FusedAttention(f) => f.named_parameters_mut(),
        }
    }
}

/// Ordered registry of named modules forming one transformer block
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    entries: Vec<(String, Module)>,
    /// Device this layer's parameters live on
    pub device: Device,
}

impl Layer {
    /// Create an empty layer on the CPU
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            device: Device::Cpu,
        }
    }

    /// Append a named module
    pub fn push(&mut self, name: impl Into<String>, module: Module) {
        self.entries.push((name.into(), module));
    }

    /// Iterate entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.entries.iter().map(|(n, m)| (n.as_str(), m))
    }

    /// Entry names in order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Look up a module by exact name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    /// Mutable lookup by exact name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    /// Flatten leaf dense projections into dotted-name → projection pairs
    ///
    /// Pure lookup. A fused attention entry contributes its inner
    /// projections under `<name>.qkv_proj` / `<name>.o_proj` while they are
    /// still dense.
    #[must_use]
    pub fn named_linears(&self) -> Vec<(String, &DenseProjection)> {
        let mut out = Vec::new();
        for (name, module) in &self.entries {
            match module {
                Module::Dense(p) => out.push((name.clone(), p)),
                Module::FusedAttention(f) => {
                    for (inner, p) in f.named_linears() {
                        out.push((format!("{name}.{inner}"), p));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Look up a dense projection by dotted name, routing into fused entries
    #[must_use]
    pub fn get_dense(&self, name: &str) -> Option<&DenseProjection> {
        if let Some(Module::Dense(p)) = self.get(name) {
            return Some(p);
        }
        let (outer, inner) = name.rsplit_once('.')?;
        if let Some(Module::FusedAttention(fused)) = self.get(outer) {
            return fused
                .named_linears()
                .into_iter()
                .find(|(n, _)| *n == inner)
                .map(|(_, p)| p);
        }
        None
    }

    /// Overwrite the slot holding `name` with a new module variant
    ///
    /// The slot keeps its position in the ordered registry. Dotted names
    /// route into a fused attention entry's inner projections.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no slot matches `name`.
    pub fn set_module_by_name(&mut self, name: &str, module: Module) -> Result<()> {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| n == name) {
            slot.1 = module;
            return Ok(());
        }

        // Route "<entry>.<inner>" into a fused attention container
        if let Some((outer, inner)) = name.rsplit_once('.') {
            if let Some(Module::FusedAttention(fused)) = self.get_mut(outer) {
                return fused.set_inner(inner, module);
            }
        }

        Err(EmpacarError::NotFound {
            name: name.to_string(),
        })
    }

    /// Remove every entry whose name equals `prefix` or starts with
    /// `"{prefix}."`, returning the removed entries in order
    pub fn remove_prefix(&mut self, prefix: &str) -> Vec<(String, Module)> {
        let dotted = format!("{prefix}.");
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|(n, _)| n == prefix || n.starts_with(&dotted));
        self.entries = kept;
        removed
    }

    /// Insert a named module at a specific slot index
    pub fn insert_at(&mut self, index: usize, name: impl Into<String>, module: Module) {
        let index = index.min(self.entries.len());
        self.entries.insert(index, (name.into(), module));
    }

    /// Index of the slot holding `name`
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter an index of named linears through exclusion fragments
///
/// A linear is excluded when its dotted name contains any fragment. A
/// fragment that matches nothing is reported with a warning and otherwise
/// ignored — a missing exclusion name is non-fatal.
#[must_use]
pub fn exclude_linears<'a>(
    named: Vec<(String, &'a DenseProjection)>,
    exclusions: &[String],
) -> Vec<(String, &'a DenseProjection)> {
    for fragment in exclusions {
        if !named.iter().any(|(name, _)| name.contains(fragment)) {
            warn!(
                fragment = fragment.as_str(),
                "exclusion fragment matches no module, skipping"
            );
        }
    }
    named
        .into_iter()
        .filter(|(name, _)| !exclusions.iter().any(|f| name.contains(f)))
        .collect()
}

/// Ordered sequence of transformer blocks plus topology facts
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Topology facts
    pub config: crate::config::ModelConfig,
    /// Transformer blocks in order
    pub layers: Vec<Layer>,
    /// Guard flag: the replacement driver refuses to run twice
    pub is_quantized: bool,
}

impl Model {
    /// Build a full-precision model with zero-initialized weights
    ///
    /// Standard decoder block layout: separate Q/K/V/O projections with a
    /// rotary holder, gate/up/down MLP projections, and a SiLU activation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on an inconsistent config.
    pub fn dense(config: &crate::config::ModelConfig) -> Result<Self> {
        Self::build(config, false)
    }

    /// Build the same topology with shape-only (unmaterialized) weights
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on an inconsistent config.
    pub fn dense_empty(config: &crate::config::ModelConfig) -> Result<Self> {
        Self::build(config, true)
    }

    fn build(config: &crate::config::ModelConfig, empty: bool) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let kv = config.kv_dim()?;
        let inter = config.intermediate_size;

        let projection = |out: usize, inf: usize| -> Result<DenseProjection> {
            if empty {
                DenseProjection::empty(inf, out, false)
            } else {
                DenseProjection::new(Tensor::zeros(vec![out, inf])?, None)
            }
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for _ in 0..config.num_hidden_layers {
            let mut layer = Layer::new();
            layer.push("self_attn.q_proj", Module::Dense(projection(hidden, hidden)?));
            layer.push("self_attn.k_proj", Module::Dense(projection(kv, hidden)?));
            layer.push("self_attn.v_proj", Module::Dense(projection(kv, hidden)?));
            layer.push("self_attn.o_proj", Module::Dense(projection(hidden, hidden)?));
            layer.push(
                "self_attn.rotary_emb",
                Module::RotaryEmbedding(RotaryEmbedding {
                    dim: config.head_dim()?,
                    theta: config.rope_theta,
                    max_seq_len: config.max_seq_len,
                }),
            );
            layer.push("mlp.gate_proj", Module::Dense(projection(inter, hidden)?));
            layer.push("mlp.up_proj", Module::Dense(projection(inter, hidden)?));
            layer.push("mlp.down_proj", Module::Dense(projection(hidden, inter)?));
            layer.push(
                "mlp.act_fn",
                Module::Activation(Activation {
                    kind: ActivationKind::Silu,
                    scale_shape: None,
                }),
            );
            layers.push(layer);
        }

        Ok(Self {
            config: config.clone(),
            layers,
            is_quantized: false,
        })
    }

    /// Full parameter set in deterministic iteration order
    ///
    /// Names follow the `model.layers.{i}.{entry}.{param}` convention used
    /// in checkpoint manifests.
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            for (name, module) in &layer.entries {
                for (param, tensor) in module.named_parameters() {
                    out.push((format!("model.layers.{i}.{name}.{param}"), tensor));
                }
            }
        }
        out
    }

    /// Mutable full parameter set (checkpoint load path)
    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            for (name, module) in &mut layer.entries {
                for (param, tensor) in module.named_parameters_mut() {
                    out.push((format!("model.layers.{i}.{name}.{param}"), tensor));
                }
            }
        }
        out
    }

    /// Whether every parameter tensor has real storage
    #[must_use]
    pub fn is_fully_materialized(&self) -> bool {
        self.named_parameters()
            .iter()
            .all(|(_, t)| t.is_materialized())
    }

    /// Total parameter byte size
    #[must_use]
    pub fn parameter_bytes(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, t)| t.byte_len())
            .sum()
    }
}
