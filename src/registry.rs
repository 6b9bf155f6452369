//! Packing-format registry and kernel selection
//!
//! Maps a requested packing format plus detected-hardware facts to a concrete
//! kernel specification. Hardware state is threaded in explicitly as
//! [`HardwareFacts`] rather than queried globally mid-algorithm, so selection
//! is a pure function and testable without an accelerator present.
//!
//! ## Formats
//!
//! - `Gemm`: generic matmul-friendly packing (default)
//! - `Gemv`: memory-bandwidth-optimized single-token packing
//! - `Exllama`: secondary-handle kernel, requires post-init activation
//! - `ExllamaV2`: secondary-handle kernel plus scratch sized by
//!   `max_batch_size x max_input_len`
//! - `Quick`: hardware-tuned split-K kernel over a fused QKV projection
//!
//! Exactly one format is active per quantized model; formats are mutually
//! incompatible within one checkpoint.

use serde::{Deserialize, Serialize};

use crate::error::{EmpacarError, Result};

/// Accelerator models that get the higher-throughput split-K Quick kernel.
///
/// An explicit allow-list of exact device identifiers, not a substring match:
/// the A1000 (a smaller-memory sibling whose name contains "A100") must never
/// select the split-K variant.
const SPLIT_K_ACCELERATORS: &[&str] = &[
    "NVIDIA A100-SXM4-40GB",
    "NVIDIA A100-SXM4-80GB",
    "NVIDIA A100-PCIE-40GB",
    "NVIDIA A100 80GB PCIe",
];

/// Split factors for the tuned Quick kernel on allow-listed accelerators
pub const QUICK_K_SPLIT: (u32, u32) = (16, 16);

/// Bit-layout and kernel-compute strategy for quantized matrix multiply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PackingFormat {
    /// Generic matmul-friendly packing
    Gemm,
    /// Memory-bandwidth-optimized single-token packing
    Gemv,
    /// Secondary-handle kernel (post-init required)
    Exllama,
    /// Secondary-handle kernel with batch/seq-sized scratch
    #[serde(rename = "EXLLAMAV2")]
    ExllamaV2,
    /// Hardware-tuned split-K kernel over fused QKV
    Quick,
}

impl PackingFormat {
    /// Whether this format needs a secondary handle allocated after load
    #[must_use]
    pub fn requires_post_init(self) -> bool {
        matches!(self, PackingFormat::Exllama | PackingFormat::ExllamaV2)
    }

    /// Whether this format packs a fused QKV projection per layer
    #[must_use]
    pub fn requires_fused_qkv(self) -> bool {
        matches!(self, PackingFormat::Quick)
    }

    /// Display name used in logs and error messages
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PackingFormat::Gemm => "GEMM",
            PackingFormat::Gemv => "GEMV",
            PackingFormat::Exllama => "EXLLAMA",
            PackingFormat::ExllamaV2 => "EXLLAMAV2",
            PackingFormat::Quick => "QUICK",
        }
    }
}

/// Detected accelerator facts, threaded explicitly into kernel selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareFacts {
    /// Detected accelerator device name, `None` when running CPU-only
    pub accelerator_name: Option<String>,
}

impl HardwareFacts {
    /// Facts for a named accelerator
    #[must_use]
    pub fn accelerator(name: impl Into<String>) -> Self {
        Self {
            accelerator_name: Some(name.into()),
        }
    }

    /// Facts for a machine with no accelerator
    #[must_use]
    pub fn cpu_only() -> Self {
        Self {
            accelerator_name: None,
        }
    }

    fn split_k_capable(&self) -> bool {
        self.accelerator_name
            .as_deref()
            .is_some_and(|name| SPLIT_K_ACCELERATORS.contains(&name))
    }
}

/// Kernel request: the checkpoint's packing format plus load-time overrides
///
/// A `Gemm` checkpoint may be loaded onto the secondary-handle kernels
/// (`use_exllama` / `use_exllama_v2`) since their packed layout is
/// compatible. The bandwidth-optimized `Gemv` layout has no secondary-handle
/// path, so combining it with either override is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRequest {
    /// Packing format recorded in the quantization config
    pub version: PackingFormat,
    /// Load onto the Exllama secondary-handle kernel
    pub use_exllama: bool,
    /// Load onto the ExllamaV2 secondary-handle kernel
    pub use_exllama_v2: bool,
}

impl KernelRequest {
    /// Request the checkpoint's own format with no overrides
    #[must_use]
    pub fn plain(version: PackingFormat) -> Self {
        Self {
            version,
            use_exllama: false,
            use_exllama_v2: false,
        }
    }
}

/// Concrete kernel constructor selection for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSpec {
    /// Kernel family to construct
    pub format: PackingFormat,
    /// Split-K factors for the tuned Quick variant
    pub k_split: Option<(u32, u32)>,
}

impl KernelSpec {
    /// Whether modules built from this spec need post-init activation
    #[must_use]
    pub fn requires_post_init(&self) -> bool {
        self.format.requires_post_init()
    }
}

/// Select the kernel constructor for a format/hardware combination
///
/// Pure function: no mutation happens on failure, so a rejected combination
/// leaves the model untouched.
///
/// # Errors
///
/// Returns `UnsupportedCombination` when the `Gemv` format is combined with
/// a secondary-handle override, or both overrides are requested at once.
pub fn select(request: &KernelRequest, hardware: &HardwareFacts) -> Result<KernelSpec> {
    if request.use_exllama && request.use_exllama_v2 {
        return Err(EmpacarError::UnsupportedCombination {
            format: request.version.as_str().to_string(),
            requested: "exllama + exllama_v2".to_string(),
            reason: "at most one secondary-handle kernel may be requested".to_string(),
        });
    }

    if request.version == PackingFormat::Gemv && (request.use_exllama || request.use_exllama_v2) {
        return Err(EmpacarError::UnsupportedCombination {
            format: "GEMV".to_string(),
            requested: if request.use_exllama {
                "exllama".to_string()
            } else {
                "exllama_v2".to_string()
            },
            reason: "bandwidth-optimized GEMV packing has no secondary-handle path".to_string(),
        });
    }

    let format = if request.use_exllama {
        PackingFormat::Exllama
    } else if request.use_exllama_v2 {
        PackingFormat::ExllamaV2
    } else {
        request.version
    };

    let k_split = if format == PackingFormat::Quick && hardware.split_k_capable() {
        Some(QUICK_K_SPLIT)
    } else {
        None
    };

    Ok(KernelSpec { format, k_split })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm_plain_selection() {
        let spec = select(
            &KernelRequest::plain(PackingFormat::Gemm),
            &HardwareFacts::cpu_only(),
        )
        .expect("select");
        assert_eq!(spec.format, PackingFormat::Gemm);
        assert_eq!(spec.k_split, None);
        assert!(!spec.requires_post_init());
    }

    #[test]
    fn test_quick_on_a100_gets_split_k() {
        let hw = HardwareFacts::accelerator("NVIDIA A100-SXM4-80GB");
        let spec = select(&KernelRequest::plain(PackingFormat::Quick), &hw).expect("select");
        assert_eq!(spec.format, PackingFormat::Quick);
        assert_eq!(spec.k_split, Some((16, 16)));
    }

    #[test]
    fn test_quick_on_a1000_confusable_gets_standard() {
        // The A1000 name contains "A100" but must not select the split-K kernel
        let hw = HardwareFacts::accelerator("NVIDIA RTX A1000");
        let spec = select(&KernelRequest::plain(PackingFormat::Quick), &hw).expect("select");
        assert_eq!(spec.k_split, None);
    }

    #[test]
    fn test_quick_on_other_hardware_gets_standard() {
        for name in ["NVIDIA GeForce RTX 4090", "NVIDIA H100 80GB HBM3"] {
            let hw = HardwareFacts::accelerator(name);
            let spec = select(&KernelRequest::plain(PackingFormat::Quick), &hw).expect("select");
            assert_eq!(spec.k_split, None, "unexpected split-K for {name}");
        }
    }

    #[test]
    fn test_quick_cpu_only_gets_standard() {
        let spec = select(
            &KernelRequest::plain(PackingFormat::Quick),
            &HardwareFacts::cpu_only(),
        )
        .expect("select");
        assert_eq!(spec.k_split, None);
    }

    #[test]
    fn test_gemv_with_exllama_rejected() {
        let request = KernelRequest {
            version: PackingFormat::Gemv,
            use_exllama: true,
            use_exllama_v2: false,
        };
        let err = select(&request, &HardwareFacts::cpu_only()).expect_err("must reject");
        assert!(matches!(err, EmpacarError::UnsupportedCombination { .. }));
    }

    #[test]
    fn test_gemv_with_exllama_v2_rejected() {
        let request = KernelRequest {
            version: PackingFormat::Gemv,
            use_exllama: false,
            use_exllama_v2: true,
        };
        let err = select(&request, &HardwareFacts::cpu_only()).expect_err("must reject");
        assert!(matches!(err, EmpacarError::UnsupportedCombination { .. }));
    }

    #[test]
    fn test_both_overrides_rejected() {
        let request = KernelRequest {
            version: PackingFormat::Gemm,
            use_exllama: true,
            use_exllama_v2: true,
        };
        assert!(select(&request, &HardwareFacts::cpu_only()).is_err());
    }

    #[test]
    fn test_gemm_upgraded_to_exllama_v2() {
        let request = KernelRequest {
            version: PackingFormat::Gemm,
            use_exllama: false,
            use_exllama_v2: true,
        };
        let spec = select(&request, &HardwareFacts::cpu_only()).expect("select");
        assert_eq!(spec.format, PackingFormat::ExllamaV2);
        assert!(spec.requires_post_init());
    }

    #[test]
    fn test_format_serde_round_trip() {
        for format in [
            PackingFormat::Gemm,
            PackingFormat::Gemv,
            PackingFormat::Exllama,
            PackingFormat::ExllamaV2,
            PackingFormat::Quick,
        ] {
            let json = serde_json::to_string(&format).expect("serialize");
            let back: PackingFormat = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, format);
        }
        assert_eq!(
            serde_json::to_string(&PackingFormat::Gemm).expect("serialize"),
            "\"GEMM\""
        );
    }
}
