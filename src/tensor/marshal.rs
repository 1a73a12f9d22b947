//! Conversion between wire `TensorProto` messages and runtime tensors
//!
//! Fixed-width data is either taken verbatim from `raw_data` (little-endian)
//! or converted element by element from the typed repeated field that ONNX
//! assigns to the element type:
//!
//! | element type                        | typed field    |
//! |-------------------------------------|----------------|
//! | FLOAT, COMPLEX64                    | `float_data`   |
//! | DOUBLE, COMPLEX128                  | `double_data`  |
//! | INT32, INT16, INT8, UINT16, UINT8,  | `int32_data`   |
//! | BOOL, FLOAT16, BFLOAT16             |                |
//! | INT64                               | `int64_data`   |
//! | UINT32, UINT64                      | `uint64_data`  |
//! | STRING                              | `string_data`  |
//!
//! Complex types store two values (real, imaginary) per element.

use super::{ElementType, Tensor, TensorData, element_count};
use crate::allocator::{AllocatorError, CpuAllocator, TensorBuffer};
use crate::grpc::proto::onnx::TensorProto;
use thiserror::Error;

/// Tensor marshaling errors
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unsupported tensor data type {0}")]
    InvalidType(i32),

    #[error("tensor shape {shape:?} has negative dimension {dim}")]
    NegativeDimension { shape: Vec<i64>, dim: i64 },

    #[error("tensor shape {shape:?} is too large to address")]
    ShapeOverflow { shape: Vec<i64> },

    #[error("{field} holds {actual} values but shape {shape:?} requires {expected}")]
    ElementCountMismatch {
        field: &'static str,
        shape: Vec<i64>,
        expected: usize,
        actual: usize,
    },

    #[error("raw_data holds {actual} bytes but {element_type} shape {shape:?} requires {expected}")]
    ByteLengthMismatch {
        element_type: ElementType,
        shape: Vec<i64>,
        expected: usize,
        actual: usize,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Allocation(#[from] AllocatorError),
}

/// Materialise a wire tensor into a runtime tensor
///
/// Fixed-width storage is obtained from `allocator`, so the buffer lives for as
/// long as the returned tensor does.
pub fn decode(proto: &TensorProto, allocator: &CpuAllocator) -> Result<Tensor, MarshalError> {
    let element_type =
        ElementType::from_wire(proto.data_type).ok_or(MarshalError::InvalidType(proto.data_type))?;
    let count = element_count(&proto.dims)?;

    let Some(size) = element_type.size() else {
        return decode_strings(proto, count);
    };

    let len = count
        .checked_mul(size)
        .ok_or_else(|| MarshalError::ShapeOverflow {
            shape: proto.dims.clone(),
        })?;

    if !proto.raw_data.is_empty() {
        if proto.raw_data.len() != len {
            return Err(MarshalError::ByteLengthMismatch {
                element_type,
                shape: proto.dims.clone(),
                expected: len,
                actual: proto.raw_data.len(),
            });
        }
        let mut buffer = allocator.allocate(len)?;
        buffer.copy_from_slice(&proto.raw_data);
        return Tensor::from_buffer(element_type, proto.dims.clone(), buffer);
    }

    // Checked before allocating: the shape alone may describe gigabytes
    let (field, actual, per_element) = typed_field(proto, element_type)?;
    let expected = count
        .checked_mul(per_element)
        .ok_or_else(|| MarshalError::ShapeOverflow {
            shape: proto.dims.clone(),
        })?;
    if actual != expected {
        return Err(MarshalError::ElementCountMismatch {
            field,
            shape: proto.dims.clone(),
            expected,
            actual,
        });
    }

    let mut buffer = allocator.allocate(len)?;
    fill_from_typed(&mut buffer, proto, element_type);
    Tensor::from_buffer(element_type, proto.dims.clone(), buffer)
}

/// Convert a runtime tensor to its wire form
///
/// `use_raw` selects `raw_data` for fixed-width types; string tensors always
/// use `string_data`. Runtime-only types have no typed field and always use
/// `raw_data`.
pub fn encode(tensor: &Tensor, use_raw: bool) -> TensorProto {
    let mut proto = TensorProto {
        dims: tensor.shape().to_vec(),
        data_type: tensor.element_type().to_wire(),
        ..Default::default()
    };

    match tensor.data() {
        TensorData::Strings(strings) => {
            proto.string_data = strings.iter().map(|s| s.as_bytes().to_vec()).collect();
        }
        TensorData::Bytes(bytes) if use_raw => proto.raw_data = bytes.to_vec(),
        TensorData::Bytes(bytes) => fill_typed(&mut proto, tensor.element_type(), bytes),
    }

    proto
}

fn decode_strings(proto: &TensorProto, count: usize) -> Result<Tensor, MarshalError> {
    if !proto.raw_data.is_empty() {
        return Err(MarshalError::InvalidArgument(
            "STRING tensors must use string_data, not raw_data".to_string(),
        ));
    }
    if proto.string_data.len() != count {
        return Err(MarshalError::ElementCountMismatch {
            field: "string_data",
            shape: proto.dims.clone(),
            expected: count,
            actual: proto.string_data.len(),
        });
    }

    let strings = proto
        .string_data
        .iter()
        .enumerate()
        .map(|(index, bytes)| {
            String::from_utf8(bytes.clone()).map_err(|e| {
                MarshalError::InvalidArgument(format!(
                    "string_data[{index}] is not valid UTF-8: {e}"
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Tensor::from_strings(proto.dims.clone(), strings)
}

/// Typed field for `element_type`: name, value count and values per element
fn typed_field(
    proto: &TensorProto,
    element_type: ElementType,
) -> Result<(&'static str, usize, usize), MarshalError> {
    let field = match element_type {
        ElementType::Float => ("float_data", proto.float_data.len(), 1),
        ElementType::Complex64 => ("float_data", proto.float_data.len(), 2),
        ElementType::Double => ("double_data", proto.double_data.len(), 1),
        ElementType::Complex128 => ("double_data", proto.double_data.len(), 2),
        ElementType::Int32
        | ElementType::Int16
        | ElementType::Int8
        | ElementType::Uint16
        | ElementType::Float16
        | ElementType::Bfloat16
        | ElementType::Uint8
        | ElementType::Bool => ("int32_data", proto.int32_data.len(), 1),
        ElementType::Int64 => ("int64_data", proto.int64_data.len(), 1),
        ElementType::Uint32 | ElementType::Uint64 => ("uint64_data", proto.uint64_data.len(), 1),
        ElementType::String | ElementType::Float8E4M3Fn | ElementType::Float8E5M2 => {
            return Err(MarshalError::InvalidArgument(format!(
                "{element_type} tensors have no typed field"
            )));
        }
    };
    Ok(field)
}

fn write_elements<T: Copy, const N: usize>(
    buffer: &mut [u8],
    values: &[T],
    to_bytes: impl Fn(T) -> [u8; N],
) {
    for (chunk, &value) in buffer.chunks_exact_mut(N).zip(values) {
        chunk.copy_from_slice(&to_bytes(value));
    }
}

/// Fill `buffer` from the typed field; lengths were checked by `typed_field`
fn fill_from_typed(buffer: &mut TensorBuffer, proto: &TensorProto, element_type: ElementType) {
    match element_type {
        ElementType::Float | ElementType::Complex64 => {
            write_elements(buffer, &proto.float_data, f32::to_le_bytes);
        }
        ElementType::Double | ElementType::Complex128 => {
            write_elements(buffer, &proto.double_data, f64::to_le_bytes);
        }
        ElementType::Int32 => write_elements(buffer, &proto.int32_data, i32::to_le_bytes),
        ElementType::Int16 => {
            write_elements(buffer, &proto.int32_data, |v| (v as i16).to_le_bytes());
        }
        ElementType::Int8 => {
            write_elements(buffer, &proto.int32_data, |v| (v as i8).to_le_bytes());
        }
        ElementType::Uint16 | ElementType::Float16 | ElementType::Bfloat16 => {
            write_elements(buffer, &proto.int32_data, |v| (v as u16).to_le_bytes());
        }
        ElementType::Uint8 => write_elements(buffer, &proto.int32_data, |v| [v as u8]),
        ElementType::Bool => write_elements(buffer, &proto.int32_data, |v| [u8::from(v != 0)]),
        ElementType::Int64 => write_elements(buffer, &proto.int64_data, i64::to_le_bytes),
        ElementType::Uint32 => {
            write_elements(buffer, &proto.uint64_data, |v| (v as u32).to_le_bytes());
        }
        ElementType::Uint64 => write_elements(buffer, &proto.uint64_data, u64::to_le_bytes),
        ElementType::String | ElementType::Float8E4M3Fn | ElementType::Float8E5M2 => {}
    }
}

fn read_elements<const N: usize, T>(bytes: &[u8], from_bytes: impl Fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut array = [0u8; N];
            array.copy_from_slice(chunk);
            from_bytes(array)
        })
        .collect()
}

fn fill_typed(proto: &mut TensorProto, element_type: ElementType, bytes: &[u8]) {
    match element_type {
        ElementType::Float | ElementType::Complex64 => {
            proto.float_data = read_elements(bytes, f32::from_le_bytes);
        }
        ElementType::Double | ElementType::Complex128 => {
            proto.double_data = read_elements(bytes, f64::from_le_bytes);
        }
        ElementType::Int32 => proto.int32_data = read_elements(bytes, i32::from_le_bytes),
        ElementType::Int16 => {
            proto.int32_data = read_elements(bytes, |b| i32::from(i16::from_le_bytes(b)));
        }
        ElementType::Int8 => {
            proto.int32_data = read_elements(bytes, |b| i32::from(i8::from_le_bytes(b)));
        }
        ElementType::Uint16 | ElementType::Float16 | ElementType::Bfloat16 => {
            proto.int32_data = read_elements(bytes, |b| i32::from(u16::from_le_bytes(b)));
        }
        ElementType::Uint8 | ElementType::Bool => {
            proto.int32_data = read_elements(bytes, |b: [u8; 1]| i32::from(b[0]));
        }
        ElementType::Int64 => proto.int64_data = read_elements(bytes, i64::from_le_bytes),
        ElementType::Uint32 => {
            proto.uint64_data = read_elements(bytes, |b| u64::from(u32::from_le_bytes(b)));
        }
        ElementType::Uint64 => proto.uint64_data = read_elements(bytes, u64::from_le_bytes),
        ElementType::Float8E4M3Fn | ElementType::Float8E5M2 => proto.raw_data = bytes.to_vec(),
        ElementType::String => {}
    }
}
