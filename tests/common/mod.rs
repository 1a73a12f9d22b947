//! Shared fixtures: an in-process model computing Y = X * X

#![allow(dead_code)]

use onnx_serving::api::AppState;
use onnx_serving::grpc::proto::onnx::TensorProto;
use onnx_serving::grpc::proto::onnx::tensor_proto::DataType;
use onnx_serving::{
    CpuAllocator, ElementType, Environment, InferenceSession, ModelMetadata, RunOptions,
    SessionCode, SessionError, Tensor, TensorInfo, metrics,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub const INPUT_VALUES: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
pub const SQUARED_VALUES: [f32; 6] = [1.0, 4.0, 9.0, 16.0, 25.0, 36.0];

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

pub fn metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

/// Model with one `[-1, 2]` float input `X` and one output `Y = X * X`
pub struct SquareSession {
    metadata: ModelMetadata,
    runs: AtomicUsize,
    delay: Option<Duration>,
    failure: Option<SessionError>,
    tags: Mutex<Vec<RunOptions>>,
}

impl SquareSession {
    pub fn new() -> Self {
        let info = |name: &str| TensorInfo {
            name: name.to_string(),
            element_type: ElementType::Float,
            dims: vec![-1, 2],
        };

        Self {
            metadata: ModelMetadata {
                name: "square".to_string(),
                inputs: vec![info("X")],
                outputs: vec![info("Y")],
            },
            runs: AtomicUsize::new(0),
            delay: None,
            failure: None,
            tags: Mutex::new(Vec::new()),
        }
    }

    /// Sleep inside every run
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every run with `error`
    pub fn failing(mut self, error: SessionError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn run_options(&self) -> Vec<RunOptions> {
        self.tags.lock().unwrap().clone()
    }
}

impl InferenceSession for SquareSession {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn run(
        &self,
        options: &RunOptions,
        mut inputs: HashMap<String, Tensor>,
        output_names: &[String],
    ) -> Result<Vec<Tensor>, SessionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.tags.lock().unwrap().push(options.clone());

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let x = inputs
            .remove("X")
            .ok_or_else(|| SessionError::new(SessionCode::InvalidArgument, "missing input X"))?;
        let values = x.to_f32_vec().ok_or_else(|| {
            SessionError::new(SessionCode::InvalidArgument, "X must be a float tensor")
        })?;
        let squared: Vec<f32> = values.iter().map(|v| v * v).collect();

        output_names
            .iter()
            .map(|name| {
                if name != "Y" {
                    return Err(SessionError::new(
                        SessionCode::InvalidArgument,
                        format!("unknown output {name}"),
                    ));
                }
                Tensor::from_f32(x.shape().to_vec(), &squared)
                    .map_err(|e| SessionError::new(SessionCode::Fail, e.to_string()))
            })
            .collect()
    }
}

pub fn environment() -> (Arc<Environment>, Arc<SquareSession>) {
    environment_with(SquareSession::new(), CpuAllocator::unbounded())
}

pub fn environment_with(
    session: SquareSession,
    allocator: CpuAllocator,
) -> (Arc<Environment>, Arc<SquareSession>) {
    let session = Arc::new(session);
    let env = Arc::new(Environment::new(session.clone(), allocator));
    (env, session)
}

pub fn app_state(env: Arc<Environment>) -> AppState {
    AppState::new(env, metrics_handle()).expect("Failed to build route table")
}

/// `[3, 2]` float tensor using `float_data`
pub fn float_input(values: &[f32]) -> TensorProto {
    TensorProto {
        dims: vec![3, 2],
        data_type: DataType::Float as i32,
        float_data: values.to_vec(),
        ..Default::default()
    }
}

/// `[3, 2]` float tensor using `raw_data`
pub fn raw_float_input(values: &[f32]) -> TensorProto {
    TensorProto {
        dims: vec![3, 2],
        data_type: DataType::Float as i32,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

/// Decode little-endian floats from `raw_data`
pub fn raw_floats(tensor: &TensorProto) -> Vec<f32> {
    tensor
        .raw_data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// JSON predict body with a `[3, 2]` `floatData` input
pub fn json_predict_body(values: &[f32]) -> serde_json::Value {
    serde_json::json!({
        "inputs": {
            "X": {
                "dims": ["3", "2"],
                "dataType": 1,
                "floatData": values,
            }
        },
        "outputFilter": ["Y"]
    })
}
