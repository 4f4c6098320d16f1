//! Tensor descriptions for inference inputs and outputs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Fp16,
    Fp32,
    Fp64,
    Bytes,
}

impl DataType {
    /// Size of one element in bytes, or `None` for variable-length types
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Int8 | DataType::Uint8 => Some(1),
            DataType::Int16 | DataType::Uint16 | DataType::Fp16 => Some(2),
            DataType::Int32 | DataType::Uint32 | DataType::Fp32 => Some(4),
            DataType::Int64 | DataType::Uint64 | DataType::Fp64 => Some(8),
            DataType::Bytes => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One named input carried by an inference request
///
/// `shape` is the declared shape excluding the batch dimension the request
/// contributes. `data` holds the raw element bytes; for shape tensors the
/// bytes are what must match across a batch, so content comparison is a
/// byte comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTensor {
    /// Tensor name as declared by the model
    pub name: String,
    /// Element type
    pub dtype: DataType,
    /// Declared shape (without the batch dimension)
    pub shape: Vec<i64>,
    /// Raw element bytes
    pub data: Vec<u8>,
}

impl InputTensor {
    /// Create a tensor from raw bytes
    pub fn new(
        name: impl Into<String>,
        dtype: DataType,
        shape: Vec<i64>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data,
        }
    }

    /// Create an `Int64` tensor from a slice of values
    pub fn from_i64s(name: impl Into<String>, shape: Vec<i64>, values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(name, DataType::Int64, shape, data)
    }

    /// Create a scalar `Int64` tensor
    pub fn scalar(name: impl Into<String>, value: i64) -> Self {
        Self::from_i64s(name, vec![1], &[value])
    }

    /// Decode the tensor contents as `i64` values
    pub fn as_i64s(&self) -> Vec<i64> {
        self.data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
            .collect()
    }

    /// Number of elements implied by the declared shape
    pub fn element_count(&self) -> i64 {
        self.shape.iter().product()
    }
}

/// Output tensors use the same description as inputs
pub type OutputTensor = InputTensor;
