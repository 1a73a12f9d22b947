//! Inference session: the loaded model behind every prediction
//!
//! The session is loaded once at startup and shared by all requests. Callers
//! hand it named runtime tensors and the output names they want, and get the
//! outputs back in the same order as the names.

#[cfg(feature = "tract")]
mod tract;

use crate::tensor::{ElementType, Tensor};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Per-run options attached to every model execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Tag carried into the run's logs, set to the request id
    pub tag: String,
    pub log_verbosity: u32,
}

/// Status codes reported by a failed session operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCode {
    Fail,
    InvalidArgument,
    NoSuchFile,
    NoModel,
    EngineError,
    RuntimeException,
    InvalidGraph,
    NotImplemented,
}

impl SessionCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionCode::Fail => "FAIL",
            SessionCode::InvalidArgument => "INVALID_ARGUMENT",
            SessionCode::NoSuchFile => "NO_SUCHFILE",
            SessionCode::NoModel => "NO_MODEL",
            SessionCode::EngineError => "ENGINE_ERROR",
            SessionCode::RuntimeException => "RUNTIME_EXCEPTION",
            SessionCode::InvalidGraph => "INVALID_GRAPH",
            SessionCode::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the session, carrying the session's own message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct SessionError {
    pub code: SessionCode,
    pub message: String,
}

impl SessionError {
    pub fn new(code: SessionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Declared input or output of the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub element_type: ElementType,
    /// Declared shape; negative entries are symbolic and match any size
    pub dims: Vec<i64>,
}

/// Model signature
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMetadata {
    pub name: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

impl ModelMetadata {
    pub fn input(&self, name: &str) -> Option<&TensorInfo> {
        self.inputs.iter().find(|info| info.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorInfo> {
        self.outputs.iter().find(|info| info.name == name)
    }

    /// Names of all declared outputs, in declaration order
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|info| info.name.clone()).collect()
    }
}

/// A loaded model
///
/// `run` is called from blocking worker threads, concurrently for distinct
/// requests; implementations must be safe for concurrent runs.
pub trait InferenceSession: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;

    /// Run the model, returning one tensor per entry of `output_names`
    fn run(
        &self,
        options: &RunOptions,
        inputs: HashMap<String, Tensor>,
        output_names: &[String],
    ) -> Result<Vec<Tensor>, SessionError>;
}

/// Load the model at `path` with the compiled-in backend
pub fn load(path: &Path) -> Result<Arc<dyn InferenceSession>, SessionError> {
    if !path.is_file() {
        return Err(SessionError::new(
            SessionCode::NoSuchFile,
            format!("model file {} does not exist", path.display()),
        ));
    }

    #[cfg(feature = "tract")]
    let session = tract::TractSession::load(path)
        .map(|session| Arc::new(session) as Arc<dyn InferenceSession>);

    #[cfg(not(feature = "tract"))]
    let session = Err(SessionError::new(
        SessionCode::NotImplemented,
        format!(
            "cannot load {}: built without a model backend (rebuild with the `tract` feature)",
            path.display()
        ),
    ));

    session
}
