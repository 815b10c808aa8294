use std::sync::Arc;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{DType, Device, Shape, TensorLayout};

/// The actual element storage behind a [`Tensor`].
///
/// `F32` is the fast path every kernel computes in; the other dtypes are
/// carried losslessly as raw bytes so initializers round-trip exactly,
/// gaining arithmetic only through an explicit cast to/from `F32` — the
/// same storage-enum pattern other inference engines use to discriminate
/// CPU vs. CUDA storage, here discriminating dtype instead since this
/// engine has one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum TensorData {
    F32(ArrayD<f32>),
    Raw(Vec<u8>),
}

/// A typed n-dimensional buffer.
///
/// Element data lives behind an `Arc` so that `Reshape` (a view, not a
/// copy) can produce a new `Tensor` with different shape metadata that
/// shares the exact same allocation — `Tensor::ptr_eq`
/// lets callers and tests confirm that identity was preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    layout: TensorLayout,
    device: Device,
    data: Arc<TensorData>,
}

impl Tensor {
    pub fn from_f32_array(array: ArrayD<f32>) -> Self {
        let shape = Shape::from(array.shape().to_vec());
        Self {
            shape,
            dtype: DType::Float32,
            layout: TensorLayout::default(),
            device: Device::Cpu,
            data: Arc::new(TensorData::F32(array)),
        }
    }

    pub fn zeros_f32(dims: &[usize]) -> Self {
        Self::from_f32_array(ArrayD::zeros(ndarray::IxDyn(dims)))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::from_f32_array(ArrayD::from_elem(ndarray::IxDyn(&[]), value))
    }

    /// Builds a tensor from raw initializer bytes of a declared dtype and
    /// shape. FLOAT32 is decoded straight into the fast `ArrayD<f32>`
    /// path; other dtypes are kept as raw bytes.
    pub fn from_raw_bytes(dtype: DType, shape: Shape, raw_data: &[u8]) -> EngineResult<Self> {
        let numel = shape.static_numel();
        let expected_len = numel * dtype.size_of();
        if raw_data.len() != expected_len {
            return Err(EngineError::invalid_model(format!(
                "initializer byte length {} does not match shape {:?} x dtype {:?} ({} bytes expected)",
                raw_data.len(),
                shape.dims(),
                dtype,
                expected_len
            )));
        }
        if dtype == DType::Float32 {
            let floats: Vec<f32> = raw_data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let array = ArrayD::from_shape_vec(ndarray::IxDyn(&shape.as_usize_dims()?), floats)
                .map_err(|e| EngineError::invalid_model(format!("bad initializer shape: {e}")))?;
            return Ok(Self::from_f32_array(array));
        }
        Ok(Self {
            shape,
            dtype,
            layout: TensorLayout::default(),
            device: Device::Cpu,
            data: Arc::new(TensorData::Raw(raw_data.to_vec())),
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.shape.static_numel()
    }

    /// Reshapes without copying, preserving the underlying buffer's
    /// identity when the element count matches. Errors if the new
    /// shape's element count differs.
    pub fn reshaped_view(&self, new_shape: Shape) -> EngineResult<Tensor> {
        if new_shape.static_numel() != self.numel() {
            return Err(EngineError::invalid_argument(format!(
                "reshape element-count mismatch: {} elements into shape {:?}",
                self.numel(),
                new_shape.dims()
            )));
        }
        Ok(Tensor {
            shape: new_shape,
            dtype: self.dtype,
            layout: self.layout,
            device: self.device,
            data: Arc::clone(&self.data),
        })
    }

    /// True if `self` and `other` share the exact same backing
    /// allocation (used to assert Reshape's view semantics in tests).
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn as_f32(&self) -> EngineResult<&ArrayD<f32>> {
        match self.data.as_ref() {
            TensorData::F32(a) => Ok(a),
            TensorData::Raw(_) => Err(EngineError::invalid_argument(format!(
                "tensor of dtype {:?} has no native f32 view; call to_f32() to cast",
                self.dtype
            ))),
        }
    }

    /// Returns a mutable f32 view, copy-on-write if the buffer is shared.
    pub fn as_f32_mut(&mut self) -> EngineResult<&mut ArrayD<f32>> {
        if !matches!(self.data.as_ref(), TensorData::F32(_)) {
            return Err(EngineError::invalid_argument(format!(
                "tensor of dtype {:?} has no native f32 view",
                self.dtype
            )));
        }
        match Arc::make_mut(&mut self.data) {
            TensorData::F32(a) => Ok(a),
            TensorData::Raw(_) => unreachable!(),
        }
    }

    /// Casts to an owned `f32` array regardless of declared dtype: the
    /// one sanctioned way compute kernels read non-float data.
    pub fn to_f32(&self) -> EngineResult<ArrayD<f32>> {
        match self.data.as_ref() {
            TensorData::F32(a) => Ok(a.clone()),
            TensorData::Raw(bytes) => {
                let dims = self.shape.as_usize_dims()?;
                let values: Vec<f32> = match self.dtype {
                    DType::Int32 => bytes
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                        .collect(),
                    DType::Int64 => bytes
                        .chunks_exact(8)
                        .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as f32)
                        .collect(),
                    DType::Int8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
                    DType::Uint8 => bytes.iter().map(|&b| b as f32).collect(),
                    DType::Float16 => bytes
                        .chunks_exact(2)
                        .map(|c| half_to_f32(u16::from_le_bytes([c[0], c[1]])))
                        .collect(),
                    DType::Float32 | DType::Unknown => {
                        return Err(EngineError::not_implemented(format!(
                            "no f32 cast defined for dtype {:?}",
                            self.dtype
                        )))
                    }
                };
                ArrayD::from_shape_vec(ndarray::IxDyn(&dims), values)
                    .map_err(|e| EngineError::invalid_argument(format!("cast shape mismatch: {e}")))
            }
        }
    }

    /// Inverse of [`Tensor::from_raw_bytes`]: the tensor's elements
    /// encoded little-endian in its declared dtype's width. FLOAT32 is
    /// re-encoded from the native `ArrayD<f32>` path; the other dtypes
    /// already carry their own bytes.
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        match self.data.as_ref() {
            TensorData::F32(array) => array.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Raw(bytes) => bytes.clone(),
        }
    }

    /// Reclaims this tensor's FLOAT32 storage as an owned `Vec<f32>` for
    /// a caller about to overwrite it wholesale, e.g. the memory pool's
    /// block-reuse path. Fails (handing `self` back unchanged) for a
    /// non-FLOAT32 tensor or one whose storage is still shared with
    /// another `Tensor` handle.
    pub fn try_into_f32_vec(self) -> Result<Vec<f32>, Tensor> {
        let Tensor { shape, dtype, layout, device, data } = self;
        if dtype != DType::Float32 {
            return Err(Tensor { shape, dtype, layout, device, data });
        }
        match Arc::try_unwrap(data) {
            Ok(TensorData::F32(array)) => Ok(array.into_raw_vec()),
            Ok(other) => Err(Tensor { shape, dtype, layout, device, data: Arc::new(other) }),
            Err(shared) => Err(Tensor { shape, dtype, layout, device, data: shared }),
        }
    }

    /// Reads an integer tensor as `i64`, used by shape-valued inputs
    /// (`Reshape`'s target-shape tensor, `Gather`'s indices) when an
    /// operator falls back to an input-tensor parameter source.
    pub fn to_i64(&self) -> EngineResult<Vec<i64>> {
        match self.data.as_ref() {
            TensorData::Raw(bytes) => match self.dtype {
                DType::Int64 => Ok(bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                    .collect()),
                DType::Int32 => Ok(bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect()),
                _ => Err(EngineError::invalid_argument(format!(
                    "dtype {:?} is not an integer dtype",
                    self.dtype
                ))),
            },
            TensorData::F32(a) => Ok(a.iter().map(|&v| v as i64).collect()),
        }
    }
}

/// Decodes an IEEE-754 binary16 (FLOAT16) value into `f32`.
fn half_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 1) as u32;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x3ff) as u32;

    let (exp32, mant32) = if exponent == 0 {
        if mantissa == 0 {
            (0, 0)
        } else {
            // Subnormal half -> normalize into f32.
            let mut e = -1i32;
            let mut m = mantissa;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            m &= 0x3ff;
            ((127 - 15 + e + 1) as u32, m << 13)
        }
    } else if exponent == 0x1f {
        (0xff, mantissa << 13)
    } else {
        (exponent - 15 + 127, mantissa << 13)
    };

    let bits32 = (sign << 31) | (exp32 << 23) | mant32;
    f32::from_bits(bits32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_preserves_pointer_identity() {
        let t = Tensor::from_f32_array(ArrayD::from_shape_vec(ndarray::IxDyn(&[2, 3]), vec![1.0; 6]).unwrap());
        let reshaped = t.reshaped_view(Shape::from(vec![3, 2])).unwrap();
        assert!(t.ptr_eq(&reshaped));
        assert_eq!(reshaped.shape().dims(), &[3, 2]);
    }

    #[test]
    fn reshape_element_count_mismatch_errors() {
        let t = Tensor::zeros_f32(&[2, 3]);
        assert!(t.reshaped_view(Shape::from(vec![4, 2])).is_err());
    }

    #[test]
    fn half_precision_round_trips_common_values() {
        assert_eq!(half_to_f32(0x3C00), 1.0);
        assert_eq!(half_to_f32(0x0000), 0.0);
        assert_eq!(half_to_f32(0xC000), -2.0);
    }

    #[test]
    fn int64_initializer_casts_to_f32() {
        let bytes: Vec<u8> = [1i64, -2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let t = Tensor::from_raw_bytes(DType::Int64, Shape::from(vec![3]), &bytes).unwrap();
        assert_eq!(t.to_f32().unwrap().into_raw_vec(), vec![1.0, -2.0, 3.0]);
        assert_eq!(t.to_i64().unwrap(), vec![1, -2, 3]);
    }

    #[test]
    fn raw_bytes_round_trip_through_from_raw_bytes() {
        let original = Tensor::from_f32_array(ArrayD::from_shape_vec(ndarray::IxDyn(&[3]), vec![1.0, -2.0, 3.5]).unwrap());
        let bytes = original.to_raw_bytes();
        let restored = Tensor::from_raw_bytes(DType::Float32, Shape::from(vec![3]), &bytes).unwrap();
        assert_eq!(restored.to_f32().unwrap().into_raw_vec(), vec![1.0, -2.0, 3.5]);
    }

    #[test]
    fn try_into_f32_vec_fails_while_shared_and_succeeds_once_sole_owner() {
        let t = Tensor::zeros_f32(&[4]);
        let clone = t.clone();
        let t = t.try_into_f32_vec().unwrap_err();
        drop(clone);
        assert_eq!(t.try_into_f32_vec().unwrap(), vec![0.0; 4]);
    }
}
