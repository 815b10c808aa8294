use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Unique identifier for a [`crate::graph::Node`], an index into the
/// owning [`crate::graph::Graph`]'s node slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Unique identifier for a [`crate::graph::Value`], an index into the
/// owning [`crate::graph::Graph`]'s value slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Element dtype, per the ONNX enum mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Float32,
    Float16,
    Int32,
    Int64,
    Int8,
    Uint8,
    Unknown,
}

impl DType {
    /// Element size in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float16 => 2,
            DType::Int32 => 4,
            DType::Int64 => 8,
            DType::Int8 => 1,
            DType::Uint8 => 1,
            DType::Unknown => 0,
        }
    }

    /// Maps the ONNX protobuf dtype enum to [`DType`].
    pub fn from_onnx_enum(value: i32) -> Self {
        match value {
            1 => DType::Float32,
            2 => DType::Uint8,
            3 => DType::Int8,
            6 => DType::Int32,
            7 => DType::Int64,
            10 => DType::Float16,
            _ => DType::Unknown,
        }
    }
}

/// Advisory tensor memory layout. Kernels are free to ignore this; only
/// the Memory Layout optimization pass reads and writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

impl Default for TensorLayout {
    fn default() -> Self {
        TensorLayout::Nchw
    }
}

/// The device a tensor or provider is associated with. Only `Cpu` is
/// required; other variants are an extension point for a future backend
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

/// Ordered sequence of dimension sizes. `-1` denotes a dynamic
/// dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.0.iter().any(|&d| d < 0)
    }

    /// Total element count. Errors if any dimension is still dynamic.
    pub fn numel(&self) -> EngineResult<usize> {
        if self.is_dynamic() {
            return Err(EngineError::invalid_argument(format!(
                "cannot compute element count of dynamic shape {:?}",
                self.0
            )));
        }
        if self.0.is_empty() {
            return Ok(1);
        }
        Ok(self.0.iter().product::<i64>() as usize)
    }

    /// Element count assuming every declared dim is already resolved
    /// (used internally once shapes are concrete); panics are avoided by
    /// falling back to 0 on negative dims.
    pub fn static_numel(&self) -> usize {
        if self.0.is_empty() {
            return 1;
        }
        self.0.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn as_usize_dims(&self) -> EngineResult<Vec<usize>> {
        self.0
            .iter()
            .map(|&d| {
                if d < 0 {
                    Err(EngineError::invalid_argument(format!(
                        "dynamic dimension -1 not allowed here (shape {:?})",
                        self.0
                    )))
                } else {
                    Ok(d as usize)
                }
            })
            .collect()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims.into_iter().map(|d| d as i64).collect())
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| d as i64).collect())
    }
}
