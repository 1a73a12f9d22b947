//! ONNX Serving - prediction front end for a loaded ONNX model
//!
//! Accepts prediction requests over HTTP (JSON body) and gRPC, routes them to the
//! loaded model, marshals wire tensors into runtime values, runs the model and
//! returns the outputs in the caller's wire format.

pub mod allocator;
pub mod api;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod grpc;
pub mod http;
pub mod metrics;
pub mod session;
pub mod tensor;

pub use allocator::{CpuAllocator, TensorBuffer};
pub use config::ServerConfig;
pub use environment::Environment;
pub use error::{Code, ServingError};
pub use executor::{Executor, InferenceRequest};
pub use session::{InferenceSession, ModelMetadata, RunOptions, SessionCode, SessionError, TensorInfo};
pub use tensor::{ElementType, Tensor, TensorData};
