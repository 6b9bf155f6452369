//! Tensor storage for weights and packed quantized buffers
//!
//! Provides the `Tensor` type used throughout the replacement and checkpoint
//! pipeline. Unlike a compute-oriented tensor, this type is storage-oriented:
//! it tracks shape, dtype, and a data buffer that may be *empty* (shape-only,
//! no storage) to support allocating a model topology before streaming
//! checkpoint shards into it.
//!
//! ## Dtypes
//!
//! - `F32`: full-precision weights, biases, activation scales
//! - `F16`: per-group quantization scales (stored as raw IEEE 754 bits)
//! - `U32`: bit-packed quantized weights and zero points

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{EmpacarError, Result};

/// Element type of a tensor's storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    /// 32-bit IEEE 754 float
    F32,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit unsigned integer (bit-packed quantized values)
    U32,
}

impl Dtype {
    /// Size of one element in bytes
    #[must_use]
    pub fn byte_size(self) -> usize {
        match self {
            Dtype::F32 | Dtype::U32 => 4,
            Dtype::F16 => 2,
        }
    }

    /// Dtype identifier as written into shard metadata
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::F32 => "F32",
            Dtype::F16 => "F16",
            Dtype::U32 => "U32",
        }
    }

    /// Parse a dtype identifier from shard metadata
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for unknown identifiers.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "F32" => Ok(Dtype::F32),
            "F16" => Ok(Dtype::F16),
            "U32" => Ok(Dtype::U32),
            other => Err(EmpacarError::FormatError {
                reason: format!("Unknown dtype '{other}' in shard metadata"),
            }),
        }
    }
}

/// Tensor storage buffer
#[derive(Debug, Clone, PartialEq)]
enum Storage {
    /// 32-bit float values
    F32(Vec<f32>),
    /// Raw f16 bits
    F16(Vec<u16>),
    /// Packed 32-bit words
    U32(Vec<u32>),
    /// Shape-only allocation, no storage yet
    Empty,
}

/// Shape- and dtype-tagged storage tensor
///
/// # Examples
///
/// ```
/// use empacar::tensor::Tensor;
///
/// let t = Tensor::from_f32(vec![2, 3], vec![1.0; 6]).unwrap();
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.size(), 6);
/// assert!(t.is_materialized());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: Dtype,
    storage: Storage,
}

impl Tensor {
    fn validate_shape(shape: &[usize], data_len: usize) -> Result<()> {
        if shape.is_empty() {
            return Err(EmpacarError::InvalidShape {
                reason: "Shape cannot be empty".to_string(),
            });
        }
        if shape.contains(&0) {
            return Err(EmpacarError::InvalidShape {
                reason: "Shape dimensions cannot be zero".to_string(),
            });
        }
        let expected: usize = shape.iter().product();
        if data_len != expected {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "Data size {data_len} does not match shape {shape:?} (expected {expected})"
                ),
            });
        }
        Ok(())
    }

    /// Create an F32 tensor from a flat row-major vector
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty, contains zero, or does
    /// not match the data length.
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::validate_shape(&shape, data.len())?;
        Ok(Self {
            shape,
            dtype: Dtype::F32,
            storage: Storage::F32(data),
        })
    }

    /// Create an F16 tensor from raw half-precision bits
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on shape/data disagreement.
    pub fn from_f16_bits(shape: Vec<usize>, bits: Vec<u16>) -> Result<Self> {
        Self::validate_shape(&shape, bits.len())?;
        Ok(Self {
            shape,
            dtype: Dtype::F16,
            storage: Storage::F16(bits),
        })
    }

    /// Create an F16 tensor by rounding f32 values to half precision
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on shape/data disagreement.
    pub fn from_f32_as_f16(shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        let bits = data.iter().map(|&v| f16::from_f32(v).to_bits()).collect();
        Self::from_f16_bits(shape, bits)
    }

    /// Create a U32 tensor from packed words
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on shape/data disagreement.
    pub fn from_u32(shape: Vec<usize>, data: Vec<u32>) -> Result<Self> {
        Self::validate_shape(&shape, data.len())?;
        Ok(Self {
            shape,
            dtype: Dtype::U32,
            storage: Storage::U32(data),
        })
    }

    /// Create an F32 tensor filled with zeros
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty or contains zero.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let size = shape.iter().product();
        Self::from_f32(shape, vec![0.0; size])
    }

    /// Create an F32 tensor filled with ones
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty or contains zero.
    pub fn ones(shape: Vec<usize>) -> Result<Self> {
        let size = shape.iter().product();
        Self::from_f32(shape, vec![1.0; size])
    }

    /// Create a shape-only tensor with no storage
    ///
    /// Used when allocating a model topology whose weights will be streamed
    /// in from checkpoint shards later.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty or contains zero.
    pub fn empty(shape: Vec<usize>, dtype: Dtype) -> Result<Self> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(EmpacarError::InvalidShape {
                reason: format!("Invalid empty-tensor shape {shape:?}"),
            });
        }
        Ok(Self {
            shape,
            dtype,
            storage: Storage::Empty,
        })
    }

    /// Shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element dtype
    #[must_use]
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Storage size in bytes once materialized
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.size() * self.dtype.byte_size()
    }

    /// Whether the tensor has real storage (vs shape-only allocation)
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        !matches!(self.storage, Storage::Empty)
    }

    /// Borrow F32 data
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the tensor is not materialized F32.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.storage {
            Storage::F32(v) => Ok(v),
            _ => Err(EmpacarError::InvalidShape {
                reason: format!("Expected materialized F32 storage, found {:?}", self.dtype),
            }),
        }
    }

    /// Borrow packed U32 data
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the tensor is not materialized U32.
    pub fn as_u32(&self) -> Result<&[u32]> {
        match &self.storage {
            Storage::U32(v) => Ok(v),
            _ => Err(EmpacarError::InvalidShape {
                reason: format!("Expected materialized U32 storage, found {:?}", self.dtype),
            }),
        }
    }

    /// Read element values as f32, converting from F16 if needed
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for unmaterialized or U32 tensors.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match &self.storage {
            Storage::F32(v) => Ok(v.clone()),
            Storage::F16(bits) => Ok(bits.iter().map(|&b| f16::from_bits(b).to_f32()).collect()),
            Storage::U32(_) => Err(EmpacarError::InvalidShape {
                reason: "Cannot convert packed U32 storage to f32".to_string(),
            }),
            Storage::Empty => Err(EmpacarError::InvalidShape {
                reason: "Cannot read values from unmaterialized tensor".to_string(),
            }),
        }
    }

    /// Serialize storage to little-endian bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the tensor is not materialized.
    pub fn to_le_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.byte_len());
        match &self.storage {
            Storage::F32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            Storage::F16(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            Storage::U32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            Storage::Empty => {
                return Err(EmpacarError::InvalidShape {
                    reason: "Cannot serialize unmaterialized tensor".to_string(),
                })
            }
        }
        Ok(out)
    }

    /// Fill a shape-only tensor from little-endian bytes
    ///
    /// The byte length must match `byte_len()` exactly. Used by the
    /// checkpoint codec to stream shard data into a pre-allocated model.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the byte length disagrees with the
    /// tensor's shape and dtype.
    pub fn materialize(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.byte_len() {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "Byte length {} does not match tensor of {} bytes (shape {:?}, dtype {:?})",
                    bytes.len(),
                    self.byte_len(),
                    self.shape,
                    self.dtype
                ),
            });
        }
        self.storage = match self.dtype {
            Dtype::F32 => Storage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().expect("4-byte chunk")))
                    .collect(),
            ),
            Dtype::F16 => Storage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes(c.try_into().expect("2-byte chunk")))
                    .collect(),
            ),
            Dtype::U32 => Storage::U32(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().expect("4-byte chunk")))
                    .collect(),
            ),
        };
        Ok(())
    }

    /// Release storage, keeping shape and dtype (memory reclaim)
    pub fn release(&mut self) {
        self.storage = Storage::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32_valid() {
        let t = Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("tensor");
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.size(), 4);
        assert_eq!(t.dtype(), Dtype::F32);
        assert!(t.is_materialized());
    }

    #[test]
    fn test_from_f32_shape_mismatch() {
        let result = Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(EmpacarError::InvalidShape { .. })));
    }

    #[test]
    fn test_empty_shape_rejects_zero_dim() {
        let result = Tensor::empty(vec![4, 0], Dtype::F32);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_then_materialize_round_trip() {
        let original =
            Tensor::from_f32(vec![2, 3], vec![1.5, -2.0, 0.0, 3.25, 4.0, -8.5]).expect("tensor");
        let bytes = original.to_le_bytes().expect("bytes");

        let mut empty = Tensor::empty(vec![2, 3], Dtype::F32).expect("empty");
        assert!(!empty.is_materialized());
        assert_eq!(empty.byte_len(), bytes.len());

        empty.materialize(&bytes).expect("materialize");
        assert_eq!(empty, original);
    }

    #[test]
    fn test_materialize_wrong_length() {
        let mut empty = Tensor::empty(vec![4], Dtype::F32).expect("empty");
        let result = empty.materialize(&[0u8; 7]);
        assert!(matches!(result, Err(EmpacarError::InvalidShape { .. })));
        assert!(!empty.is_materialized());
    }

    #[test]
    fn test_f16_round_trip_via_bytes() {
        let values = [1.0f32, 0.5, -0.25, 2.0];
        let t = Tensor::from_f32_as_f16(vec![4], &values).expect("f16");
        assert_eq!(t.dtype(), Dtype::F16);
        assert_eq!(t.byte_len(), 8);

        let recovered = t.to_f32_vec().expect("values");
        // These values are exactly representable in f16
        assert_eq!(recovered, values.to_vec());
    }

    #[test]
    fn test_u32_bytes() {
        let t = Tensor::from_u32(vec![2], vec![0xDEAD_BEEF, 0x0102_0304]).expect("u32");
        let bytes = t.to_le_bytes().expect("bytes");
        assert_eq!(bytes, vec![0xEF, 0xBE, 0xAD, 0xDE, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_release_drops_storage() {
        let mut t = Tensor::from_f32(vec![8], vec![1.0; 8]).expect("tensor");
        t.release();
        assert!(!t.is_materialized());
        assert_eq!(t.shape(), &[8]);
        assert!(t.as_f32().is_err());
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!(Dtype::parse("F32").expect("f32"), Dtype::F32);
        assert_eq!(Dtype::parse("F16").expect("f16"), Dtype::F16);
        assert_eq!(Dtype::parse("U32").expect("u32"), Dtype::U32);
        assert!(Dtype::parse("I64").is_err());
    }
}
