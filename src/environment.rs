//! Process-wide serving environment
//!
//! Holds the loaded model session and the CPU allocator, and hands out the
//! per-request logging span. Built once at startup and shared by reference
//! with every request.

use crate::allocator::CpuAllocator;
use crate::config::ServerConfig;
use crate::session::{self, InferenceSession, ModelMetadata};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

pub struct Environment {
    session: Arc<dyn InferenceSession>,
    allocator: CpuAllocator,
}

impl Environment {
    pub fn new(session: Arc<dyn InferenceSession>, allocator: CpuAllocator) -> Self {
        Self { session, allocator }
    }

    /// Create the allocator and load the configured model
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let allocator = CpuAllocator::create(config.allocator_budget_bytes())
            .context("Failed to create CPU allocator")?;
        let session = session::load(&config.model_path)
            .with_context(|| format!("Failed to load model {:?}", config.model_path))?;

        let metadata = session.metadata();
        tracing::info!(
            model = %metadata.name,
            path = %config.model_path.display(),
            inputs = metadata.inputs.len(),
            outputs = metadata.outputs.len(),
            "Model loaded"
        );

        Ok(Self::new(session, allocator))
    }

    pub fn session(&self) -> Arc<dyn InferenceSession> {
        self.session.clone()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        self.session.metadata()
    }

    pub fn allocator(&self) -> &CpuAllocator {
        &self.allocator
    }

    /// Logging span for one request
    ///
    /// Everything logged inside the span carries the request id.
    pub fn request_span(&self, request_id: &str) -> Span {
        if request_id.is_empty() {
            tracing::warn!("Creating request logger with an empty request id");
        }
        tracing::info_span!(
            "request",
            request_id = %request_id,
            model = %self.session.metadata().name
        )
    }
}

/// Fresh request id
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RunOptions, SessionError};
    use crate::tensor::Tensor;
    use std::collections::HashMap;

    struct EmptySession(ModelMetadata);

    impl InferenceSession for EmptySession {
        fn metadata(&self) -> &ModelMetadata {
            &self.0
        }

        fn run(
            &self,
            _options: &RunOptions,
            _inputs: HashMap<String, Tensor>,
            _output_names: &[String],
        ) -> Result<Vec<Tensor>, SessionError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_request_ids_unique() {
        let first = new_request_id();
        let second = new_request_id();
        assert_ne!(first, second);
        assert_eq!(first.len(), 36);
    }

    #[test]
    fn test_accessors() {
        let metadata = ModelMetadata {
            name: "empty".to_string(),
            ..Default::default()
        };
        let env = Environment::new(
            Arc::new(EmptySession(metadata)),
            CpuAllocator::create(Some(64)).unwrap(),
        );

        assert_eq!(env.metadata().name, "empty");
        assert_eq!(env.allocator().budget(), Some(64));
        assert_eq!(env.session().metadata().name, "empty");

        // Empty ids are allowed but logged
        let _span = env.request_span("");
    }

    #[test]
    fn test_from_config_missing_model() {
        let config = ServerConfig {
            model_path: "/nonexistent/model.onnx".into(),
            ..Default::default()
        };
        let err = match Environment::from_config(&config) {
            Err(err) => err,
            Ok(_) => panic!("expected model load to fail"),
        };
        assert!(format!("{err:#}").contains("does not exist"));
    }
}
