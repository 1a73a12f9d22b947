//! PredictionService implementation

use super::proto::serving::v1::prediction_service_server::PredictionService;
use super::proto::serving::v1::{PredictRequest, PredictResponse};
use crate::environment::{Environment, new_request_id};
use crate::error::ServingError;
use crate::executor::{Executor, InferenceRequest, validate_inputs};
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Request, Response, Status};
use tracing::Instrument;

/// Server-generated id attached to every response, success or failure
pub const REQUEST_ID_HEADER: &str = "x-ms-request-id";

/// Caller-supplied correlation id, echoed back when present
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

#[derive(Clone)]
pub struct PredictionServiceImpl {
    env: Arc<Environment>,
    request_timeout: Option<Duration>,
}

impl PredictionServiceImpl {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Response metadata: the request id plus the echoed client id
    fn response_metadata(request_id: &str, request_metadata: &MetadataMap) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        match MetadataValue::try_from(request_id) {
            Ok(value) => {
                metadata.insert(REQUEST_ID_HEADER, value);
            }
            Err(e) => tracing::warn!(error = %e, "Request id is not a valid header value"),
        }
        if let Some(client_id) = request_metadata.get(CLIENT_REQUEST_ID_HEADER) {
            metadata.insert(CLIENT_REQUEST_ID_HEADER, client_id.clone());
        }
        metadata
    }

    async fn run(
        &self,
        request_id: String,
        request: PredictRequest,
    ) -> Result<PredictResponse, ServingError> {
        let request = InferenceRequest::from(request);
        validate_inputs(self.env.metadata(), &request)?;

        Executor::new(self.env.clone(), request_id)
            .with_timeout(self.request_timeout)
            .predict(request)
            .await
    }
}

#[tonic::async_trait]
impl PredictionService for PredictionServiceImpl {
    async fn predict(
        &self,
        request: Request<PredictRequest>,
    ) -> Result<Response<PredictResponse>, Status> {
        let request_id = new_request_id();
        let metadata = Self::response_metadata(&request_id, request.metadata());
        let span = self.env.request_span(&request_id);

        let result = self
            .run(request_id, request.into_inner())
            .instrument(span.clone())
            .await;

        match result {
            Ok(message) => {
                crate::metrics::record_request("grpc", "OK");
                let mut response = Response::new(message);
                *response.metadata_mut() = metadata;
                Ok(response)
            }
            Err(err) => {
                let status = err.to_status(metadata);
                crate::metrics::record_request("grpc", &format!("{:?}", status.code()));
                span.in_scope(|| tracing::warn!(error = %err, code = ?status.code(), "Prediction failed"));
                Err(status)
            }
        }
    }
}
