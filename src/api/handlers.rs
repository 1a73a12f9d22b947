//! API request handlers

use super::json;
use super::models::{HealthResponse, ModelMetadataResponse};
use super::router::{Resolution, RouteParams};
use super::routes::AppState;
use crate::environment::new_request_id;
use crate::error::ServingError;
use crate::executor::{Executor, validate_inputs};
use axum::{
    Json,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use tracing::Instrument;

/// Handler stored in the routing table
pub type Handler = fn(RequestContext) -> BoxFuture<'static, Response>;

/// Everything a routed handler gets about its request
pub struct RequestContext {
    pub state: AppState,
    pub params: RouteParams,
    pub request_id: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// GET /health - Server health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
}

/// Fallback for every other path: resolve through the model routing table
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = new_request_id();
    let span = state.env.request_span(&request_id);
    let path = uri.path();

    let response = match state.routes.resolve(&method, path) {
        Resolution::Matched { handler, params } => {
            span.in_scope(|| {
                tracing::debug!(
                    model = %params.model,
                    version = %params.version,
                    action = %params.action,
                    "Route matched"
                )
            });
            match body {
                Ok(body) => {
                    let ctx = RequestContext {
                        state: state.clone(),
                        params,
                        request_id,
                        headers,
                        body,
                    };
                    handler(ctx).instrument(span).await
                }
                Err(rejection) => {
                    let err = ServingError::from_body_rejection(rejection);
                    span.in_scope(|| tracing::warn!(error = %err, "Request body rejected"));
                    err.into_response()
                }
            }
        }
        Resolution::MethodNotAllowed => {
            span.in_scope(|| tracing::info!(%method, path, "Method not allowed"));
            ServingError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            }
            .into_response()
        }
        Resolution::NotFound => {
            span.in_scope(|| tracing::info!(%method, path, "No route"));
            ServingError::NotFound(path.to_string()).into_response()
        }
    };

    crate::metrics::record_request("http", response.status().as_str());
    response
}

/// POST classify / regress / predict
///
/// All three actions run the same prediction against the loaded model.
pub fn predict(ctx: RequestContext) -> BoxFuture<'static, Response> {
    Box::pin(async move {
        let RequestContext {
            state,
            params,
            request_id,
            body,
            ..
        } = ctx;

        match run_predict(&state, request_id, &body).await {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    model = %params.model,
                    action = %params.action,
                    "Prediction failed"
                );
                err.into_response()
            }
        }
    })
}

async fn run_predict(
    state: &AppState,
    request_id: String,
    body: &[u8],
) -> Result<Vec<u8>, ServingError> {
    let request = json::decode_request(body)?;
    validate_inputs(state.env.metadata(), &request)?;

    let response = Executor::new(state.env.clone(), request_id)
        .with_timeout(state.request_timeout)
        .predict(request)
        .await?;

    json::encode_response(&response)
}

/// GET model signature
pub fn model_metadata(ctx: RequestContext) -> BoxFuture<'static, Response> {
    Box::pin(async move {
        let metadata = ModelMetadataResponse::new(ctx.state.env.metadata(), ctx.params.version);
        (StatusCode::OK, Json(metadata)).into_response()
    })
}
