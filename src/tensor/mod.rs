//! Runtime tensor values
//!
//! A [`Tensor`] is the in-process form of a wire `TensorProto`: an element type,
//! a shape and either a contiguous little-endian byte buffer or, for string
//! tensors, a list of owned strings.

mod marshal;

pub use marshal::{MarshalError, decode, encode};

use crate::allocator::TensorBuffer;
use crate::grpc::proto::onnx::tensor_proto::DataType;
use std::fmt;

/// Element types understood by the runtime
///
/// Mirrors the ONNX data types. The two 8-bit float variants exist only inside
/// the runtime and have no wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Float,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Double,
    Uint32,
    Uint64,
    Complex64,
    Complex128,
    Bfloat16,
    Float8E4M3Fn,
    Float8E5M2,
}

impl ElementType {
    /// Every element type, in wire tag order
    pub const ALL: [ElementType; 18] = [
        ElementType::Float,
        ElementType::Uint8,
        ElementType::Int8,
        ElementType::Uint16,
        ElementType::Int16,
        ElementType::Int32,
        ElementType::Int64,
        ElementType::String,
        ElementType::Bool,
        ElementType::Float16,
        ElementType::Double,
        ElementType::Uint32,
        ElementType::Uint64,
        ElementType::Complex64,
        ElementType::Complex128,
        ElementType::Bfloat16,
        ElementType::Float8E4M3Fn,
        ElementType::Float8E5M2,
    ];

    /// Bytes per element, `None` for strings
    pub const fn size(self) -> Option<usize> {
        match self {
            ElementType::Uint8
            | ElementType::Int8
            | ElementType::Bool
            | ElementType::Float8E4M3Fn
            | ElementType::Float8E5M2 => Some(1),
            ElementType::Uint16
            | ElementType::Int16
            | ElementType::Float16
            | ElementType::Bfloat16 => Some(2),
            ElementType::Float | ElementType::Int32 | ElementType::Uint32 => Some(4),
            ElementType::Int64
            | ElementType::Uint64
            | ElementType::Double
            | ElementType::Complex64 => Some(8),
            ElementType::Complex128 => Some(16),
            ElementType::String => None,
        }
    }

    /// Map a wire `data_type` tag; `None` for UNDEFINED and unknown tags
    pub fn from_wire(tag: i32) -> Option<Self> {
        let element_type = match DataType::try_from(tag).ok()? {
            DataType::Undefined => return None,
            DataType::Float => ElementType::Float,
            DataType::Uint8 => ElementType::Uint8,
            DataType::Int8 => ElementType::Int8,
            DataType::Uint16 => ElementType::Uint16,
            DataType::Int16 => ElementType::Int16,
            DataType::Int32 => ElementType::Int32,
            DataType::Int64 => ElementType::Int64,
            DataType::String => ElementType::String,
            DataType::Bool => ElementType::Bool,
            DataType::Float16 => ElementType::Float16,
            DataType::Double => ElementType::Double,
            DataType::Uint32 => ElementType::Uint32,
            DataType::Uint64 => ElementType::Uint64,
            DataType::Complex64 => ElementType::Complex64,
            DataType::Complex128 => ElementType::Complex128,
            DataType::Bfloat16 => ElementType::Bfloat16,
        };
        Some(element_type)
    }

    /// Wire tag; runtime-only types map to UNDEFINED (0)
    pub fn to_wire(self) -> i32 {
        let data_type = match self {
            ElementType::Float => DataType::Float,
            ElementType::Uint8 => DataType::Uint8,
            ElementType::Int8 => DataType::Int8,
            ElementType::Uint16 => DataType::Uint16,
            ElementType::Int16 => DataType::Int16,
            ElementType::Int32 => DataType::Int32,
            ElementType::Int64 => DataType::Int64,
            ElementType::String => DataType::String,
            ElementType::Bool => DataType::Bool,
            ElementType::Float16 => DataType::Float16,
            ElementType::Double => DataType::Double,
            ElementType::Uint32 => DataType::Uint32,
            ElementType::Uint64 => DataType::Uint64,
            ElementType::Complex64 => DataType::Complex64,
            ElementType::Complex128 => DataType::Complex128,
            ElementType::Bfloat16 => DataType::Bfloat16,
            ElementType::Float8E4M3Fn | ElementType::Float8E5M2 => DataType::Undefined,
        };
        data_type as i32
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Float => "FLOAT",
            ElementType::Uint8 => "UINT8",
            ElementType::Int8 => "INT8",
            ElementType::Uint16 => "UINT16",
            ElementType::Int16 => "INT16",
            ElementType::Int32 => "INT32",
            ElementType::Int64 => "INT64",
            ElementType::String => "STRING",
            ElementType::Bool => "BOOL",
            ElementType::Float16 => "FLOAT16",
            ElementType::Double => "DOUBLE",
            ElementType::Uint32 => "UINT32",
            ElementType::Uint64 => "UINT64",
            ElementType::Complex64 => "COMPLEX64",
            ElementType::Complex128 => "COMPLEX128",
            ElementType::Bfloat16 => "BFLOAT16",
            ElementType::Float8E4M3Fn => "FLOAT8E4M3FN",
            ElementType::Float8E5M2 => "FLOAT8E5M2",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tensor storage
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bytes(TensorBuffer),
    Strings(Vec<String>),
}

/// A typed, shaped runtime value
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    element_type: ElementType,
    shape: Vec<i64>,
    data: TensorData,
}

impl Tensor {
    /// Build a fixed-width tensor; the buffer length must equal
    /// `element_count(shape) * element_type.size()`
    pub fn from_buffer(
        element_type: ElementType,
        shape: Vec<i64>,
        buffer: TensorBuffer,
    ) -> Result<Self, MarshalError> {
        let Some(size) = element_type.size() else {
            return Err(MarshalError::InvalidArgument(
                "STRING tensors must be built from strings".to_string(),
            ));
        };
        let expected = element_count(&shape)?
            .checked_mul(size)
            .ok_or_else(|| MarshalError::ShapeOverflow {
                shape: shape.clone(),
            })?;
        if buffer.len() != expected {
            return Err(MarshalError::ByteLengthMismatch {
                element_type,
                shape,
                expected,
                actual: buffer.len(),
            });
        }

        Ok(Self {
            element_type,
            shape,
            data: TensorData::Bytes(buffer),
        })
    }

    /// Build a string tensor holding one string per element
    pub fn from_strings(shape: Vec<i64>, strings: Vec<String>) -> Result<Self, MarshalError> {
        let expected = element_count(&shape)?;
        if strings.len() != expected {
            return Err(MarshalError::ElementCountMismatch {
                field: "string_data",
                shape,
                expected,
                actual: strings.len(),
            });
        }

        Ok(Self {
            element_type: ElementType::String,
            shape,
            data: TensorData::Strings(strings),
        })
    }

    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Result<Self, MarshalError> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_buffer(ElementType::Float, shape, TensorBuffer::detached(bytes))
    }

    pub fn from_i64(shape: Vec<i64>, values: &[i64]) -> Result<Self, MarshalError> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_buffer(ElementType::Int64, shape, TensorBuffer::detached(bytes))
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Number of elements described by the shape
    pub fn len(&self) -> usize {
        match &self.data {
            TensorData::Strings(strings) => strings.len(),
            TensorData::Bytes(bytes) => self
                .element_type
                .size()
                .map_or(0, |size| bytes.len() / size),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::Bytes(bytes) => Some(bytes),
            TensorData::Strings(_) => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            TensorData::Strings(strings) => Some(strings),
            TensorData::Bytes(_) => None,
        }
    }

    /// Decode a FLOAT tensor's elements
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.element_type != ElementType::Float {
            return None;
        }
        let bytes = self.as_bytes()?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

/// Product of the dimensions, rejecting negative dimensions and overflow
pub fn element_count(shape: &[i64]) -> Result<usize, MarshalError> {
    shape.iter().try_fold(1usize, |count, &dim| {
        let dim = usize::try_from(dim).map_err(|_| MarshalError::NegativeDimension {
            shape: shape.to_vec(),
            dim,
        })?;
        count
            .checked_mul(dim)
            .ok_or_else(|| MarshalError::ShapeOverflow {
                shape: shape.to_vec(),
            })
    })
}
