//! Session backed by the tract ONNX engine

use super::{InferenceSession, ModelMetadata, RunOptions, SessionCode, SessionError, TensorInfo};
use crate::allocator::TensorBuffer;
use crate::tensor::{ElementType, Tensor, TensorData};
use std::collections::HashMap;
use std::path::Path;
use tract_onnx::prelude::{
    Datum, DatumType, Framework, Graph, InferenceModelExt, IntoTValue, OutletId, SimplePlan,
    TVec, TypedFact, TypedModel, TypedOp, f16, tract_ndarray,
};

type OnnxModelPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub struct TractSession {
    plan: OnnxModelPlan,
    metadata: ModelMetadata,
}

fn engine_error(code: SessionCode) -> impl Fn(tract_onnx::prelude::TractError) -> SessionError {
    move |e| SessionError::new(code, format!("{e:#}"))
}

impl TractSession {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(engine_error(SessionCode::InvalidGraph))?
            .into_optimized()
            .map_err(engine_error(SessionCode::InvalidGraph))?;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let inputs = model
            .input_outlets()
            .map_err(engine_error(SessionCode::InvalidGraph))?
            .iter()
            .map(|&outlet| describe(&model, outlet))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = model
            .output_outlets()
            .map_err(engine_error(SessionCode::InvalidGraph))?
            .iter()
            .map(|&outlet| describe(&model, outlet))
            .collect::<Result<Vec<_>, _>>()?;

        let plan = model
            .into_runnable()
            .map_err(engine_error(SessionCode::EngineError))?;

        Ok(Self {
            plan,
            metadata: ModelMetadata {
                name,
                inputs,
                outputs,
            },
        })
    }
}

fn describe(model: &TypedModel, outlet: OutletId) -> Result<TensorInfo, SessionError> {
    let name = model
        .outlet_label(outlet)
        .map(str::to_string)
        .unwrap_or_else(|| model.node(outlet.node).name.clone());
    let fact = model
        .outlet_fact(outlet)
        .map_err(engine_error(SessionCode::InvalidGraph))?;
    let element_type = element_type(fact.datum_type).ok_or_else(|| {
        SessionError::new(
            SessionCode::NotImplemented,
            format!("tensor '{name}' has unsupported type {:?}", fact.datum_type),
        )
    })?;
    let dims = fact
        .shape
        .iter()
        .map(|dim| dim.to_i64().unwrap_or(-1))
        .collect();

    Ok(TensorInfo {
        name,
        element_type,
        dims,
    })
}

fn element_type(datum_type: DatumType) -> Option<ElementType> {
    let element_type = match datum_type {
        DatumType::F32 => ElementType::Float,
        DatumType::F64 => ElementType::Double,
        DatumType::F16 => ElementType::Float16,
        DatumType::U8 => ElementType::Uint8,
        DatumType::I8 => ElementType::Int8,
        DatumType::U16 => ElementType::Uint16,
        DatumType::I16 => ElementType::Int16,
        DatumType::I32 => ElementType::Int32,
        DatumType::I64 => ElementType::Int64,
        DatumType::U32 => ElementType::Uint32,
        DatumType::U64 => ElementType::Uint64,
        DatumType::Bool => ElementType::Bool,
        DatumType::String => ElementType::String,
        _ => return None,
    };
    Some(element_type)
}

fn to_tract(name: &str, tensor: Tensor) -> Result<tract_onnx::prelude::Tensor, SessionError> {
    let invalid = |message: String| SessionError::new(SessionCode::InvalidArgument, message);
    let shape = tensor
        .shape()
        .iter()
        .map(|&dim| usize::try_from(dim))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid(format!("input '{name}' has a negative dimension")))?;
    let element_type = tensor.element_type();

    let converted = match tensor.into_data() {
        TensorData::Strings(strings) => {
            tract_ndarray::ArrayD::from_shape_vec(shape, strings).map(Into::into)
        }
        TensorData::Bytes(bytes) => match element_type {
            ElementType::Float => typed_array(shape, &bytes, f32::from_le_bytes),
            ElementType::Double => typed_array(shape, &bytes, f64::from_le_bytes),
            ElementType::Float16 => {
                typed_array(shape, &bytes, |b| f16::from_bits(u16::from_le_bytes(b)))
            }
            ElementType::Uint8 => typed_array(shape, &bytes, u8::from_le_bytes),
            ElementType::Int8 => typed_array(shape, &bytes, i8::from_le_bytes),
            ElementType::Uint16 => typed_array(shape, &bytes, u16::from_le_bytes),
            ElementType::Int16 => typed_array(shape, &bytes, i16::from_le_bytes),
            ElementType::Int32 => typed_array(shape, &bytes, i32::from_le_bytes),
            ElementType::Int64 => typed_array(shape, &bytes, i64::from_le_bytes),
            ElementType::Uint32 => typed_array(shape, &bytes, u32::from_le_bytes),
            ElementType::Uint64 => typed_array(shape, &bytes, u64::from_le_bytes),
            ElementType::Bool => typed_array(shape, &bytes, |b: [u8; 1]| b[0] != 0),
            other => {
                return Err(invalid(format!(
                    "input '{name}' has type {other} which the engine cannot run"
                )));
            }
        },
    };
    converted.map_err(|e| invalid(format!("input '{name}': {e}")))
}

/// Little-endian bytes as an engine tensor of `T`
fn typed_array<T: Datum, const N: usize>(
    shape: Vec<usize>,
    bytes: &[u8],
    from_bytes: impl Fn([u8; N]) -> T,
) -> Result<tract_onnx::prelude::Tensor, tract_ndarray::ShapeError> {
    let values = bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut array = [0u8; N];
            array.copy_from_slice(chunk);
            from_bytes(array)
        })
        .collect();
    tract_ndarray::ArrayD::from_shape_vec(shape, values).map(Into::into)
}

/// Engine tensor of `T` as little-endian bytes
fn le_bytes<T: Datum + Copy, const N: usize>(
    value: &tract_onnx::prelude::Tensor,
    to_bytes: impl Fn(T) -> [u8; N],
) -> Result<Vec<u8>, SessionError> {
    Ok(value
        .as_slice::<T>()
        .map_err(engine_error(SessionCode::RuntimeException))?
        .iter()
        .flat_map(|&v| to_bytes(v))
        .collect())
}

fn from_tract(value: &tract_onnx::prelude::Tensor) -> Result<Tensor, SessionError> {
    let element_type = element_type(value.datum_type()).ok_or_else(|| {
        SessionError::new(
            SessionCode::NotImplemented,
            format!("output type {:?} is not supported", value.datum_type()),
        )
    })?;
    let shape = value.shape().iter().map(|&dim| dim as i64).collect();
    let invalid = |e: crate::tensor::MarshalError| {
        SessionError::new(SessionCode::RuntimeException, e.to_string())
    };

    let bytes = match element_type {
        ElementType::String => {
            let strings = value
                .as_slice::<String>()
                .map_err(engine_error(SessionCode::RuntimeException))?
                .to_vec();
            return Tensor::from_strings(shape, strings).map_err(invalid);
        }
        ElementType::Float => le_bytes(value, f32::to_le_bytes)?,
        ElementType::Double => le_bytes(value, f64::to_le_bytes)?,
        ElementType::Float16 => le_bytes(value, |v: f16| v.to_bits().to_le_bytes())?,
        ElementType::Uint8 => le_bytes(value, u8::to_le_bytes)?,
        ElementType::Int8 => le_bytes(value, i8::to_le_bytes)?,
        ElementType::Uint16 => le_bytes(value, u16::to_le_bytes)?,
        ElementType::Int16 => le_bytes(value, i16::to_le_bytes)?,
        ElementType::Int32 => le_bytes(value, i32::to_le_bytes)?,
        ElementType::Int64 => le_bytes(value, i64::to_le_bytes)?,
        ElementType::Uint32 => le_bytes(value, u32::to_le_bytes)?,
        ElementType::Uint64 => le_bytes(value, u64::to_le_bytes)?,
        ElementType::Bool => le_bytes(value, |v: bool| [u8::from(v)])?,
        other => {
            return Err(SessionError::new(
                SessionCode::NotImplemented,
                format!("output type {other} is not supported"),
            ));
        }
    };
    Tensor::from_buffer(element_type, shape, TensorBuffer::detached(bytes)).map_err(invalid)
}

impl InferenceSession for TractSession {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn run(
        &self,
        options: &RunOptions,
        mut inputs: HashMap<String, Tensor>,
        output_names: &[String],
    ) -> Result<Vec<Tensor>, SessionError> {
        tracing::trace!(tag = %options.tag, verbosity = options.log_verbosity, "Running tract plan");

        let mut values = TVec::new();
        for info in &self.metadata.inputs {
            let tensor = inputs.remove(&info.name).ok_or_else(|| {
                SessionError::new(
                    SessionCode::InvalidArgument,
                    format!("missing input '{}'", info.name),
                )
            })?;
            values.push(to_tract(&info.name, tensor)?.into_tvalue());
        }

        let outputs = self
            .plan
            .run(values)
            .map_err(engine_error(SessionCode::RuntimeException))?;

        output_names
            .iter()
            .map(|name| {
                let index = self
                    .metadata
                    .outputs
                    .iter()
                    .position(|info| &info.name == name)
                    .ok_or_else(|| {
                        SessionError::new(
                            SessionCode::InvalidArgument,
                            format!("model has no output named '{name}'"),
                        )
                    })?;
                from_tract(&outputs[index])
            })
            .collect()
    }
}
