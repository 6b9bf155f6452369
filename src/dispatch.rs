//! Device placement and checkpoint dispatch
//!
//! A freshly built quantized model carries shape-only tensors with no
//! storage. Before its shards are streamed in, every transformer block is
//! assigned a device through a `DevicePlacementPlan`. The plan is validated
//! up front: each block must be covered by exactly one rule, and a block is
//! atomic (its attention and MLP leaves always land on the same device).
//!
//! `dispatch_checkpoint` ties the pieces together: validate the plan, stamp
//! devices onto the layer graph, then stream shard data into the placed
//! modules.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EmpacarError, Result};
use crate::module::Model;

/// Where a layer's parameters live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host memory
    Cpu,
    /// Accelerator by ordinal
    Cuda(u32),
    /// Parameters stay on disk until paged in
    Disk,
}

impl Device {
    /// True for devices that can run packed kernels directly
    #[must_use]
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Self::Cuda(_))
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// One placement rule: a module-path prefix and its target device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRule {
    /// Module path prefix, e.g. `model.layers.3` or `model.layers`
    pub prefix: String,
    /// Target device for everything the prefix covers
    pub device: Device,
}

/// Device assignment for a model's transformer blocks
///
/// Rules are matched against block paths (`model.layers.{i}`) by path-segment
/// prefix, so `model.layers.1` covers block 1 but not block 10.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevicePlacementPlan {
    rules: Vec<PlacementRule>,
}

/// True when `prefix` covers `path` at a path-segment boundary
fn covers(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

impl DevicePlacementPlan {
    /// Plan placing every block on a single device
    #[must_use]
    pub fn single_device(device: Device) -> Self {
        Self {
            rules: vec![PlacementRule {
                prefix: "model.layers".to_string(),
                device,
            }],
        }
    }

    /// Plan built from explicit rules
    #[must_use]
    pub fn from_rules(rules: Vec<PlacementRule>) -> Self {
        Self { rules }
    }

    /// Rules in declaration order
    #[must_use]
    pub fn rules(&self) -> &[PlacementRule] {
        &self.rules
    }

    /// Resolve the device for one block path
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` when zero or more than one rule
    /// covers the path. A block is atomic, so two rules splitting it
    /// between devices is rejected rather than resolved by precedence.
    pub fn resolve(&self, path: &str) -> Result<Device> {
        let matching: Vec<&PlacementRule> = self
            .rules
            .iter()
            .filter(|rule| covers(&rule.prefix, path))
            .collect();
        match matching.as_slice() {
            [] => Err(EmpacarError::InvalidConfiguration {
                reason: format!("No placement rule covers '{path}'"),
            }),
            [rule] => Ok(rule.device),
            many => {
                let devices: std::collections::HashSet<Device> =
                    many.iter().map(|r| r.device).collect();
                if devices.len() == 1 {
                    Ok(many[0].device)
                } else {
                    Err(EmpacarError::InvalidConfiguration {
                        reason: format!(
                            "'{path}' is covered by {} rules targeting different devices",
                            many.len()
                        ),
                    })
                }
            }
        }
    }

    /// Validate the plan against a model without mutating it
    ///
    /// Every block must resolve to exactly one device, and every rule must
    /// cover at least one block (a dead rule is a typo until proven
    /// otherwise).
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for uncovered blocks, conflicting
    /// rules, or rules matching nothing.
    pub fn validate(&self, model: &Model) -> Result<Vec<Device>> {
        let mut placements = Vec::with_capacity(model.layers.len());
        for i in 0..model.layers.len() {
            placements.push(self.resolve(&format!("model.layers.{i}"))?);
        }
        for rule in &self.rules {
            let covers_any = (0..model.layers.len())
                .any(|i| covers(&rule.prefix, &format!("model.layers.{i}")));
            if !covers_any {
                return Err(EmpacarError::InvalidConfiguration {
                    reason: format!("Placement rule '{}' matches no module", rule.prefix),
                });
            }
        }
        Ok(placements)
    }

    /// Validate and stamp devices onto the model's layers
    ///
    /// # Errors
    ///
    /// Same as [`DevicePlacementPlan::validate`]; on error the model is
    /// left untouched.
    pub fn apply(&self, model: &mut Model) -> Result<()> {
        let placements = self.validate(model)?;
        for (i, (layer, device)) in model.layers.iter_mut().zip(&placements).enumerate() {
            debug!(layer = i, device = %device, "placing block");
            layer.device = *device;
        }
        Ok(())
    }
}

/// Place a model's blocks and stream its checkpoint into them
///
/// The placement plan is validated before any file is opened, so a bad plan
/// never leaves a half-loaded model behind.
///
/// # Errors
///
/// Placement errors from [`DevicePlacementPlan::apply`] plus load errors
/// from [`crate::checkpoint::load_checkpoint`].
pub fn dispatch_checkpoint(
    model: &mut Model,
    plan: &DevicePlacementPlan,
    dir: &Path,
) -> Result<()> {
    plan.apply(model)?;
    crate::checkpoint::load_checkpoint(model, dir)?;
    info!(layers = model.layers.len(), "checkpoint dispatched");
    Ok(())
}
