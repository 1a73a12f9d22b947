//! Request executor
//!
//! Runs one prediction: materialises the wire inputs, invokes the model on a
//! blocking worker and builds the wire response. One executor is created per
//! request and is never shared.

use crate::environment::Environment;
use crate::error::ServingError;
use crate::grpc::proto::onnx::TensorProto;
use crate::grpc::proto::serving::v1::{PredictRequest, PredictResponse};
use crate::session::{ModelMetadata, RunOptions};
use crate::tensor::{self, ElementType, Tensor};
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Verbosity attached to every model run
pub const RUN_LOG_VERBOSITY: u32 = 4;

/// Protocol-neutral prediction request
///
/// Inputs keep their arrival order, duplicates included; the protobuf map type
/// cannot express duplicates, so only the JSON path produces them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceRequest {
    pub inputs: Vec<(String, TensorProto)>,
    pub output_filter: Vec<String>,
}

impl From<PredictRequest> for InferenceRequest {
    fn from(request: PredictRequest) -> Self {
        let mut inputs: Vec<_> = request.inputs.into_iter().collect();
        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            inputs,
            output_filter: request.output_filter,
        }
    }
}

pub struct Executor {
    env: Arc<Environment>,
    request_id: String,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(env: Arc<Environment>, request_id: impl Into<String>) -> Self {
        Self {
            env,
            request_id: request_id.into(),
            timeout: None,
        }
    }

    /// Bound the model run; `None` waits indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Run the prediction and build the response
    ///
    /// Outputs use `raw_data` when every input did, typed fields otherwise.
    pub async fn predict(&self, request: InferenceRequest) -> Result<PredictResponse, ServingError> {
        let started = Instant::now();
        let result = self.run_prediction(request).await;
        crate::metrics::record_prediction(started.elapsed(), result.is_ok());
        result
    }

    async fn run_prediction(
        &self,
        request: InferenceRequest,
    ) -> Result<PredictResponse, ServingError> {
        let allocator = self.env.allocator();
        let mut using_raw_data = true;
        let mut inputs = HashMap::with_capacity(request.inputs.len());

        for (name, proto) in request.inputs {
            using_raw_data &= !proto.raw_data.is_empty();

            match inputs.entry(name) {
                Entry::Occupied(slot) => {
                    tracing::error!(input = %slot.key(), "Duplicate input name");
                    return Err(ServingError::AlreadyExists(slot.key().clone()));
                }
                Entry::Vacant(slot) => {
                    let tensor = tensor::decode(&proto, allocator).map_err(|e| {
                        tracing::error!(input = %slot.key(), error = %e, "Failed to convert input tensor");
                        ServingError::from_marshal(slot.key(), e)
                    })?;
                    slot.insert(tensor);
                }
            }
        }

        let output_names = if request.output_filter.is_empty() {
            self.env.metadata().output_names()
        } else {
            request.output_filter
        };

        let options = RunOptions {
            tag: self.request_id.clone(),
            log_verbosity: RUN_LOG_VERBOSITY,
        };
        let outputs = self
            .run_session(options, inputs, output_names.clone())
            .await?;

        if outputs.len() != output_names.len() {
            return Err(ServingError::Internal(format!(
                "model returned {} outputs for {} requested",
                outputs.len(),
                output_names.len()
            )));
        }

        let mut response = PredictResponse::default();
        for (name, output) in output_names.into_iter().zip(outputs) {
            response
                .outputs
                .insert(name, tensor::encode(&output, using_raw_data));
        }

        tracing::debug!(
            outputs = response.outputs.len(),
            raw = using_raw_data,
            "Prediction complete"
        );
        Ok(response)
    }

    async fn run_session(
        &self,
        options: RunOptions,
        inputs: HashMap<String, Tensor>,
        output_names: Vec<String>,
    ) -> Result<Vec<Tensor>, ServingError> {
        let session = self.env.session();
        let span = tracing::Span::current();
        let task = tokio::task::spawn_blocking(move || {
            span.in_scope(|| session.run(&options, inputs, &output_names))
        });

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                tracing::error!(timeout_ms = limit.as_millis() as u64, "Model run timed out");
                ServingError::DeadlineExceeded(limit)
            })?,
            None => task.await,
        };

        joined
            .map_err(|e| ServingError::Internal(format!("model run did not complete: {e}")))?
            .map_err(|e| {
                tracing::error!(code = %e.code, error = %e.message, "Run() failed");
                ServingError::from(e)
            })
    }
}

/// Check a request against the model signature
///
/// Runs before any tensor is materialised. A repeated input name is reported
/// as `AlreadyExists` ahead of any signature problem. Negative declared
/// dimensions are symbolic and accept any size.
pub fn validate_inputs(
    metadata: &ModelMetadata,
    request: &InferenceRequest,
) -> Result<(), ServingError> {
    let mut seen = HashSet::with_capacity(request.inputs.len());
    for (name, _) in &request.inputs {
        if !seen.insert(name.as_str()) {
            return Err(ServingError::AlreadyExists(name.clone()));
        }
    }

    if request.inputs.is_empty() {
        return Err(ServingError::InvalidArgument(
            "request contains no inputs".to_string(),
        ));
    }

    for (name, proto) in &request.inputs {
        let Some(declared) = metadata.input(name) else {
            return Err(ServingError::InvalidArgument(format!(
                "model has no input named '{name}'"
            )));
        };

        if let Some(element_type) = ElementType::from_wire(proto.data_type)
            && element_type != declared.element_type
        {
            return Err(ServingError::InvalidArgument(format!(
                "input '{name}' has type {element_type}, model expects {}",
                declared.element_type
            )));
        }

        if proto.dims.len() != declared.dims.len() {
            return Err(ServingError::InvalidArgument(format!(
                "input '{name}' has rank {}, model expects rank {} (shape {:?})",
                proto.dims.len(),
                declared.dims.len(),
                declared.dims
            )));
        }

        for (axis, (&actual, &expected)) in proto.dims.iter().zip(&declared.dims).enumerate() {
            if expected >= 0 && actual != expected {
                return Err(ServingError::InvalidArgument(format!(
                    "input '{name}' dimension {axis} is {actual}, model expects {expected}"
                )));
            }
        }
    }

    for declared in &metadata.inputs {
        if !request.inputs.iter().any(|(name, _)| *name == declared.name) {
            return Err(ServingError::InvalidArgument(format!(
                "missing required input '{}'",
                declared.name
            )));
        }
    }

    for name in &request.output_filter {
        if metadata.output(name).is_none() {
            return Err(ServingError::InvalidArgument(format!(
                "model has no output named '{name}'"
            )));
        }
    }

    Ok(())
}
