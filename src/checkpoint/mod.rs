//! Checkpoint sharding codec
//!
//! Serializes a model's full parameter set into size-bounded shard files plus
//! an index manifest, and performs the reverse in-place load into an
//! allocated-but-empty module graph.
//!
//! ## Layout
//!
//! Single-shard checkpoints are written as one `model.safetensors` file.
//! Multi-shard checkpoints use `model-00001-of-0000N.safetensors` files plus
//! `model.safetensors.index.json`:
//!
//! ```text
//! {
//!   "metadata": { "total_size": 4194304 },
//!   "weight_map": { "model.layers.0...qweight": "model-00001-of-00004.safetensors", ... }
//! }
//! ```
//!
//! Each shard file follows the safetensors framing: an 8-byte little-endian
//! metadata length, a JSON map of `name -> {dtype, shape, data_offsets}`, and
//! the raw tensor bytes.
//!
//! Parameters are binned greedily in iteration order; no shard exceeds the
//! byte budget except when a single parameter is itself larger than the
//! budget, in which case it gets its own shard. The manifest is written only
//! after every shard write has succeeded.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EmpacarError, Result};
use crate::module::Model;
use crate::tensor::{Dtype, Tensor};

#[cfg(test)]
mod tests;

/// Single-file checkpoint name
pub const WEIGHTS_NAME: &str = "model.safetensors";

/// Manifest filename for sharded checkpoints
pub const INDEX_NAME: &str = "model.safetensors.index.json";

/// Default shard byte budget (10 GiB)
pub const DEFAULT_SHARD_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Stale default-name files removed before a custom-shard save
const DEFAULT_CLEANUP_NAMES: &[&str] = &[WEIGHTS_NAME, INDEX_NAME, "pytorch_model.bin"];

/// Index manifest: parameter name -> shard file, plus total byte size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Checkpoint-level metadata
    pub metadata: ManifestMetadata,
    /// Mapping from parameter name to the shard file holding it
    pub weight_map: BTreeMap<String, String>,
}

/// Manifest metadata block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Total parameter bytes across all shards
    pub total_size: u64,
}

/// JSON tensor metadata inside a shard header
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorHeader {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// One planned shard: parameter names in iteration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    /// Parameter names assigned to this shard
    pub names: Vec<String>,
    /// Total payload bytes
    pub bytes: u64,
}

/// Greedily bin parameters into size-bounded shards in iteration order
///
/// A parameter larger than the budget becomes its own shard; every other
/// shard stays within the budget.
#[must_use]
pub fn plan_shards(params: &[(String, &Tensor)], max_shard_bytes: u64) -> Vec<ShardPlan> {
    let mut plans: Vec<ShardPlan> = Vec::new();
    let mut current = ShardPlan {
        names: Vec::new(),
        bytes: 0,
    };

    for (name, tensor) in params {
        let size = tensor.byte_len() as u64;
        if !current.names.is_empty() && current.bytes + size > max_shard_bytes {
            plans.push(std::mem::replace(
                &mut current,
                ShardPlan {
                    names: Vec::new(),
                    bytes: 0,
                },
            ));
        }
        current.names.push(name.clone());
        current.bytes += size;
    }
    if !current.names.is_empty() {
        plans.push(current);
    }
    plans
}

/// Shard filename for index `i` (1-based) of `total` shards
#[must_use]
pub fn shard_filename(i: usize, total: usize) -> String {
    if total == 1 {
        WEIGHTS_NAME.to_string()
    } else {
        format!("model-{i:05}-of-{total:05}.safetensors")
    }
}

/// Remove stale default-name checkpoint files (idempotent)
fn ensure_defaults_absent(dir: &Path) -> Result<()> {
    for name in DEFAULT_CLEANUP_NAMES {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EmpacarError::IoError {
                    message: format!("Failed to remove stale '{}': {e}", path.display()),
                })
            }
        }
    }
    Ok(())
}

/// Write one shard file in safetensors framing
fn write_shard(path: &Path, entries: &[(String, &Tensor)]) -> Result<()> {
    let mut headers = serde_json::Map::new();
    let mut offset = 0usize;
    for (name, tensor) in entries {
        let end = offset + tensor.byte_len();
        let header = TensorHeader {
            dtype: tensor.dtype().as_str().to_string(),
            shape: tensor.shape().to_vec(),
            data_offsets: [offset, end],
        };
        headers.insert(
            name.clone(),
            serde_json::to_value(header).map_err(|e| EmpacarError::FormatError {
                reason: format!("Failed to encode shard header: {e}"),
            })?,
        );
        offset = end;
    }

    let header_json =
        serde_json::to_string(&serde_json::Value::Object(headers)).map_err(|e| {
            EmpacarError::FormatError {
                reason: format!("Failed to encode shard header: {e}"),
            }
        })?;

    let mut file = std::fs::File::create(path).map_err(|e| EmpacarError::IoError {
        message: format!("Failed to create shard '{}': {e}", path.display()),
    })?;
    let io_err = |e: std::io::Error| EmpacarError::IoError {
        message: format!("Failed to write shard '{}': {e}", path.display()),
    };
    file.write_all(&(header_json.len() as u64).to_le_bytes())
        .map_err(io_err)?;
    file.write_all(header_json.as_bytes()).map_err(io_err)?;
    for (_, tensor) in entries {
        file.write_all(&tensor.to_le_bytes()?).map_err(io_err)?;
    }
    file.flush().map_err(io_err)?;
    Ok(())
}

/// Save report: shard files written and manifest presence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    /// Shard filenames in write order
    pub shard_files: Vec<String>,
    /// Whether an index manifest was written (multi-shard checkpoints)
    pub manifest_written: bool,
    /// Total parameter bytes
    pub total_size: u64,
}

/// Serialize the model's full parameter set into `dir`
///
/// Shard writes happen first; the manifest is written only after all of
/// them succeed. Stale default-name files are removed up front so a
/// re-save never leaves a mixed layout behind.
///
/// # Errors
///
/// Returns `InvalidShape` for unmaterialized parameters and `IoError` on
/// filesystem failures.
pub fn save_checkpoint(model: &Model, dir: &Path, max_shard_bytes: u64) -> Result<SaveReport> {
    let params = model.named_parameters();
    for (name, tensor) in &params {
        if !tensor.is_materialized() {
            return Err(EmpacarError::InvalidShape {
                reason: format!("Cannot save unmaterialized parameter '{name}'"),
            });
        }
    }

    std::fs::create_dir_all(dir).map_err(|e| EmpacarError::IoError {
        message: format!("Failed to create '{}': {e}", dir.display()),
    })?;
    ensure_defaults_absent(dir)?;

    let plans = plan_shards(&params, max_shard_bytes);
    let total_shards = plans.len();
    let by_name: HashMap<&str, &Tensor> =
        params.iter().map(|(n, t)| (n.as_str(), *t)).collect();

    let mut shard_files = Vec::with_capacity(total_shards);
    let mut weight_map = BTreeMap::new();
    let mut total_size = 0u64;

    for (i, plan) in plans.iter().enumerate() {
        let filename = shard_filename(i + 1, total_shards);
        let entries: Vec<(String, &Tensor)> = plan
            .names
            .iter()
            .map(|n| (n.clone(), by_name[n.as_str()]))
            .collect();
        write_shard(&dir.join(&filename), &entries)?;
        for name in &plan.names {
            weight_map.insert(name.clone(), filename.clone());
        }
        total_size += plan.bytes;
        shard_files.push(filename);
    }

    let manifest_written = total_shards > 1;
    if manifest_written {
        let manifest = CheckpointManifest {
            metadata: ManifestMetadata { total_size },
            weight_map,
        };
        let json =
            serde_json::to_string_pretty(&manifest).map_err(|e| EmpacarError::FormatError {
                reason: format!("Failed to encode manifest: {e}"),
            })?;
        let path = dir.join(INDEX_NAME);
        std::fs::write(&path, json).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to write manifest '{}': {e}", path.display()),
        })?;
    }

    info!(
        shards = total_shards,
        total_size, "checkpoint saved"
    );
    Ok(SaveReport {
        shard_files,
        manifest_written,
        total_size,
    })
}

/// Memory-mapped shard reader
///
/// Parses the safetensors framing once; tensor bytes stay on disk until
/// copied into their destination module.
#[derive(Debug)]
pub struct ShardReader {
    mmap: memmap2::Mmap,
    tensors: HashMap<String, TensorInfo>,
    data_offset: usize,
    path: PathBuf,
}

/// Parsed per-tensor metadata from a shard header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Element dtype
    pub dtype: Dtype,
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Byte range within the shard's data section
    pub data_offsets: [usize; 2],
}

impl ShardReader {
    /// Open and parse a shard file
    ///
    /// # Errors
    ///
    /// Returns `ShardMissing` when the file does not exist, `IoError` on
    /// open/mmap failures, and `FormatError` on malformed framing.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EmpacarError::ShardMissing {
                filename: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            });
        }
        let file = std::fs::File::open(path).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to open shard '{}': {e}", path.display()),
        })?;
        // SAFETY: file is opened read-only and never modified while mapped
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .map_err(|e| EmpacarError::IoError {
                    message: format!("Failed to mmap shard '{}': {e}", path.display()),
                })?
        };

        if mmap.len() < 8 {
            return Err(EmpacarError::FormatError {
                reason: format!(
                    "Shard '{}' too small: {} bytes (minimum 8)",
                    path.display(),
                    mmap.len()
                ),
            });
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[0..8]);
        let header_len = u64::from_le_bytes(len_bytes);
        let header_len = usize::try_from(header_len).map_err(|_| EmpacarError::FormatError {
            reason: format!("Shard header length {header_len} exceeds platform limit"),
        })?;
        let data_offset = 8 + header_len;
        if mmap.len() < data_offset {
            return Err(EmpacarError::FormatError {
                reason: format!(
                    "Shard '{}' truncated: header claims {header_len} bytes",
                    path.display()
                ),
            });
        }

        let headers: HashMap<String, TensorHeader> =
            serde_json::from_slice(&mmap[8..data_offset]).map_err(|e| {
                EmpacarError::FormatError {
                    reason: format!("Malformed shard header in '{}': {e}", path.display()),
                }
            })?;

        let mut tensors = HashMap::with_capacity(headers.len());
        for (name, h) in headers {
            tensors.insert(
                name,
                TensorInfo {
                    dtype: Dtype::parse(&h.dtype)?,
                    shape: h.shape,
                    data_offsets: h.data_offsets,
                },
            );
        }

        Ok(Self {
            mmap,
            tensors,
            data_offset,
            path: path.to_path_buf(),
        })
    }

    /// Tensor metadata by name
    #[must_use]
    pub fn info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    /// Number of tensors in the shard
    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Raw tensor bytes by name (zero-copy slice into the mapping)
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names and `FormatError` for offsets
    /// outside the data section.
    pub fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let info = self.tensors.get(name).ok_or_else(|| EmpacarError::NotFound {
            name: name.to_string(),
        })?;
        let [start, end] = info.data_offsets;
        let (abs_start, abs_end) = (self.data_offset + start, self.data_offset + end);
        if abs_end > self.mmap.len() || start > end {
            return Err(EmpacarError::FormatError {
                reason: format!(
                    "Tensor '{name}' offsets [{start}, {end}) exceed shard '{}'",
                    self.path.display()
                ),
            });
        }
        Ok(&self.mmap[abs_start..abs_end])
    }
}

/// Resolve the checkpoint layout inside `dir`
///
/// Sharded checkpoints are identified by the index manifest; otherwise a
/// single `model.safetensors` is expected.
///
/// # Errors
///
/// Returns `FormatError` on a malformed manifest and `ShardMissing` when
/// neither layout is present.
pub fn read_manifest(dir: &Path) -> Result<Option<CheckpointManifest>> {
    let index_path = dir.join(INDEX_NAME);
    if index_path.exists() {
        let content = std::fs::read_to_string(&index_path).map_err(|e| EmpacarError::IoError {
            message: format!("Failed to read manifest '{}': {e}", index_path.display()),
        })?;
        let manifest =
            serde_json::from_str(&content).map_err(|e| EmpacarError::FormatError {
                reason: format!("Malformed manifest '{}': {e}", index_path.display()),
            })?;
        return Ok(Some(manifest));
    }
    if dir.join(WEIGHTS_NAME).exists() {
        return Ok(None);
    }
    Err(EmpacarError::ShardMissing {
        filename: WEIGHTS_NAME.to_string(),
    })
}

/// Stream checkpoint shards into a pre-allocated (empty-weight) model
///
/// Every parameter the model expects must be present with a matching shape
/// and dtype. A failing load leaves no partially-loaded model exposed as
/// valid: the error is returned before the caller ever sees the model as
/// loaded.
///
/// # Errors
///
/// - `ShardMissing` when a manifest-referenced file is absent
/// - `ParameterShapeMismatch` when a tensor's shape disagrees with the
///   pre-allocated module
/// - `FormatError` on dtype disagreements or missing parameters
pub fn load_checkpoint(model: &mut Model, dir: &Path) -> Result<()> {
    let manifest = read_manifest(dir)?;

    // Open every referenced shard up front so a missing file aborts before
    // any parameter is touched
    let mut readers: HashMap<String, ShardReader> = HashMap::new();
    let shard_for: HashMap<String, String> = match &manifest {
        Some(m) => {
            for filename in m.weight_map.values() {
                if !readers.contains_key(filename) {
                    readers.insert(filename.clone(), ShardReader::open(&dir.join(filename))?);
                }
            }
            m.weight_map.clone().into_iter().collect()
        }
        None => {
            readers.insert(
                WEIGHTS_NAME.to_string(),
                ShardReader::open(&dir.join(WEIGHTS_NAME))?,
            );
            HashMap::new()
        }
    };

    let single = manifest.is_none();
    for (name, tensor) in model.named_parameters_mut() {
        let reader = if single {
            &readers[WEIGHTS_NAME]
        } else {
            let filename = shard_for.get(&name).ok_or_else(|| EmpacarError::FormatError {
                reason: format!("Parameter '{name}' missing from manifest"),
            })?;
            &readers[filename]
        };

        let info = reader.info(&name).ok_or_else(|| EmpacarError::FormatError {
            reason: format!("Parameter '{name}' missing from checkpoint"),
        })?;
        if info.shape != tensor.shape() {
            return Err(EmpacarError::ParameterShapeMismatch {
                name,
                expected: tensor.shape().to_vec(),
                actual: info.shape.clone(),
            });
        }
        if info.dtype != tensor.dtype() {
            return Err(EmpacarError::FormatError {
                reason: format!(
                    "Parameter '{name}' dtype {:?} disagrees with expected {:?}",
                    info.dtype,
                    tensor.dtype()
                ),
            });
        }
        tensor.materialize(reader.tensor_bytes(&name)?)?;
    }

    info!(shards = readers.len(), "checkpoint loaded");
    Ok(())
}
