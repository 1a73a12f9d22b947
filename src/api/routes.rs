//! API route definitions

use super::handlers::{self, Handler};
use super::router::{RouteError, Routes};
use crate::environment::Environment;
use crate::http::session::stamp_headers;
use axum::{Router, extract::DefaultBodyLimit, http::Method, middleware, routing::get};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Prediction: `/v1/models/{model}(/versions/{version})?:{classify|regress|predict}`
pub const PREDICT_PATTERN: &str = r"/v1/models/([^/:]+)(?:/versions/(\d+))?:(classify|regress|predict)";

/// Model signature: `/v1/models/{model}(/versions/{version})?/metadata`
pub const METADATA_PATTERN: &str = r"/v1/models/([^/:]+)(?:/versions/(\d+))?/(metadata)";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub env: Arc<Environment>,
    pub routes: Arc<Routes<Handler>>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub request_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(
        env: Arc<Environment>,
        prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Result<Self, RouteError> {
        Ok(Self {
            env,
            routes: Arc::new(model_routes()?),
            prometheus_handle,
            request_timeout: None,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Model routes, in match order
pub fn model_routes() -> Result<Routes<Handler>, RouteError> {
    Routes::new()
        .register(Method::POST, PREDICT_PATTERN, handlers::predict as Handler)?
        .register(Method::GET, METADATA_PATTERN, handlers::model_metadata)
}

/// Create the main API router
///
/// Model paths are resolved by the regex routing table in the fallback; health
/// and metrics are plain axum routes.
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .fallback(handlers::dispatch)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(stamp_headers))
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
}
