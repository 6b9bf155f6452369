//! Quantized model lifecycle
//!
//! [`QuantModel`] ties the pieces of the crate into the two checkpoint
//! flows:
//!
//! - **Quantize and save**: a full-precision model is run through the
//!   replacement driver with real weight packing, then serialized as
//!   size-bounded shards plus its configs.
//! - **Load quantized**: the topology is rebuilt from the persisted configs
//!   with shape-only packed modules, shards are streamed into their slots
//!   per a device placement plan, and the kernel handle is initialized for
//!   formats that need a second pass.

use std::path::Path;

use tracing::info;

use crate::checkpoint::{save_checkpoint, SaveReport, DEFAULT_SHARD_BYTES};
use crate::config::{ModelConfig, QuantConfig, PROCESSOR_CONFIG_FILENAME};
use crate::dispatch::{dispatch_checkpoint, DevicePlacementPlan};
use crate::error::{EmpacarError, Result};
use crate::module::Model;
use crate::pack::GroupQuantizer;
use crate::postinit::{post_init, KernelHandle, PostInitOptions};
use crate::registry::{HardwareFacts, KernelRequest, KernelSpec};
use crate::replace::{run_replacement, Materialization, ReplacementOptions};

/// A transformer model together with its quantization lifecycle state
#[derive(Debug)]
pub struct QuantModel {
    /// The layer graph
    pub model: Model,
    /// Quantization recipe
    pub quant_config: QuantConfig,
    /// Kernel spec selected by the replacement driver
    spec: Option<KernelSpec>,
    /// Secondary kernel handle, present once post-init has run
    handle: Option<KernelHandle>,
    /// Whether kernel activation has run; it may run at most once
    activated: bool,
    /// Optional vision processor config carried through save/load
    processor_config: Option<serde_json::Value>,
}

impl QuantModel {
    /// Wrap a full-precision model for quantization
    pub fn new(model: Model, quant_config: QuantConfig) -> Self {
        Self {
            model,
            quant_config,
            spec: None,
            handle: None,
            activated: false,
            processor_config: None,
        }
    }

    /// Build a full-precision model from topology facts
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on an inconsistent config.
    pub fn dense(config: &ModelConfig, quant_config: QuantConfig) -> Result<Self> {
        Ok(Self::new(Model::dense(config)?, quant_config))
    }

    /// Kernel spec selected by the replacement driver, if it has run
    #[must_use]
    pub fn spec(&self) -> Option<&KernelSpec> {
        self.spec.as_ref()
    }

    /// Secondary kernel handle, if post-init has run
    #[must_use]
    pub fn handle(&self) -> Option<&KernelHandle> {
        self.handle.as_ref()
    }

    /// Initialize the kernel handle for a loaded model
    ///
    /// Runs at most once per model: a second call is rejected rather than
    /// re-allocating the handle or its scratch workspace.
    ///
    /// # Errors
    ///
    /// - `AlreadyQuantized` when activation has already run
    /// - `PrematureActivation` when the replacement driver has not selected
    ///   a kernel yet, or from [`post_init`]'s load-state guards
    pub fn activate_kernels(&mut self, options: &PostInitOptions) -> Result<()> {
        if self.activated {
            return Err(EmpacarError::AlreadyQuantized {
                reason: "kernel activation already ran on this model".to_string(),
            });
        }
        let spec = self.spec.ok_or_else(|| EmpacarError::PrematureActivation {
            reason: "No kernel selected; run the replacement driver first".to_string(),
        })?;
        self.handle = post_init(&self.model, &spec, options)?;
        self.activated = true;
        Ok(())
    }

    /// Attach a vision processor config to carry through save
    pub fn set_processor_config(&mut self, config: serde_json::Value) {
        self.processor_config = Some(config);
    }

    /// Quantize the model in place: compute group parameters per projection
    /// and pack every eligible linear into its low-bit module
    ///
    /// # Errors
    ///
    /// See [`run_replacement`].
    pub fn quantize(
        &mut self,
        quantizer: &dyn GroupQuantizer,
        hardware: &HardwareFacts,
    ) -> Result<()> {
        let options = ReplacementOptions {
            quant_config: &self.quant_config,
            request: KernelRequest::plain(self.quant_config.version),
            hardware,
            mode: Materialization::Pack,
        };
        self.spec = Some(run_replacement(&mut self.model, &options, quantizer)?);
        Ok(())
    }

    /// Replace modules with shape-only packed counterparts, without weights
    ///
    /// Split out from [`QuantModel::quantize`] for flows that fill packed
    /// buffers from an external source instead of packing locally.
    ///
    /// # Errors
    ///
    /// See [`run_replacement`].
    pub fn pack(&mut self, request: KernelRequest, hardware: &HardwareFacts) -> Result<()> {
        let options = ReplacementOptions {
            quant_config: &self.quant_config,
            request,
            hardware,
            mode: Materialization::EmptyWeights,
        };
        self.spec = Some(run_replacement(&mut self.model, &options, &NoQuantizer)?);
        Ok(())
    }

    /// Serialize the quantized model, its configs, and the optional
    /// processor config into `dir`
    ///
    /// # Errors
    ///
    /// Returns `PrematureActivation`-adjacent sequencing errors as
    /// `InvalidConfiguration` when the model was never quantized, plus the
    /// codec's I/O errors.
    pub fn save_quantized(&self, dir: &Path, max_shard_bytes: u64) -> Result<SaveReport> {
        if !self.model.is_quantized {
            return Err(EmpacarError::InvalidConfiguration {
                reason: "Cannot save a model that has not been quantized".to_string(),
            });
        }
        let report = save_checkpoint(&self.model, dir, max_shard_bytes)?;
        self.model.config.save(dir)?;
        self.quant_config.save(dir)?;
        if let Some(processor) = &self.processor_config {
            let path = dir.join(PROCESSOR_CONFIG_FILENAME);
            let json = serde_json::to_string_pretty(processor).map_err(|e| {
                EmpacarError::FormatError {
                    reason: format!("Failed to serialize processor config: {e}"),
                }
            })?;
            std::fs::write(&path, json).map_err(|e| EmpacarError::IoError {
                message: format!("Failed to write '{}': {e}", path.display()),
            })?;
        }
        info!(dir = %dir.display(), shards = report.shard_files.len(), "model saved");
        Ok(report)
    }

    /// Load a quantized checkpoint directory end to end
    ///
    /// Rebuilds the topology from the persisted configs with shape-only
    /// packed modules, places blocks per `plan`, streams shard data into
    /// them, and initializes the kernel handle for formats that require a
    /// second pass.
    ///
    /// # Errors
    ///
    /// Config, placement, codec, and post-init errors from the respective
    /// stages; on any of them no partially-loaded model is returned.
    pub fn from_quantized(
        dir: &Path,
        request_overrides: (bool, bool),
        plan: &DevicePlacementPlan,
        hardware: &HardwareFacts,
        post_init_options: &PostInitOptions,
    ) -> Result<Self> {
        let config = ModelConfig::load(dir)?;
        let quant_config = QuantConfig::load(dir)?;

        let mut model = Model::dense_empty(&config)?;
        let (use_exllama, use_exllama_v2) = request_overrides;
        let request = KernelRequest {
            version: quant_config.version,
            use_exllama,
            use_exllama_v2,
        };
        let options = ReplacementOptions {
            quant_config: &quant_config,
            request,
            hardware,
            mode: Materialization::EmptyWeights,
        };
        let spec = run_replacement(&mut model, &options, &NoQuantizer)?;

        dispatch_checkpoint(&mut model, plan, dir)?;

        let processor_config = read_processor_config(dir)?;
        let mut loaded = Self {
            model,
            quant_config,
            spec: Some(spec),
            handle: None,
            activated: false,
            processor_config,
        };
        loaded.activate_kernels(post_init_options)?;

        info!(dir = %dir.display(), format = spec.format.as_str(), "model loaded");
        Ok(loaded)
    }

    /// Convenience wrapper over [`QuantModel::save_quantized`] with the
    /// default shard budget
    ///
    /// # Errors
    ///
    /// See [`QuantModel::save_quantized`].
    pub fn save_quantized_default(&self, dir: &Path) -> Result<SaveReport> {
        self.save_quantized(dir, DEFAULT_SHARD_BYTES)
    }
}

/// Placeholder quantizer for shape-only flows; the driver never calls it
struct NoQuantizer;

impl GroupQuantizer for NoQuantizer {
    fn quantize(
        &self,
        name: &str,
        _projection: &crate::pack::DenseProjection,
        _w_bit: u32,
        _group_size: usize,
    ) -> Result<crate::pack::QuantizationParameters> {
        Err(EmpacarError::InvalidConfiguration {
            reason: format!("No quantizer available for '{name}' in shape-only mode"),
        })
    }
}

fn read_processor_config(dir: &Path) -> Result<Option<serde_json::Value>> {
    let path = dir.join(PROCESSOR_CONFIG_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| EmpacarError::IoError {
        message: format!("Failed to read '{}': {e}", path.display()),
    })?;
    let value = serde_json::from_str(&content).map_err(|e| EmpacarError::FormatError {
        reason: format!("Failed to parse '{}': {e}", path.display()),
    })?;
    Ok(Some(value))
}
