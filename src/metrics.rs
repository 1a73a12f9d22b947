//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a finished request on either adapter
pub fn record_request(protocol: &'static str, code: &str) {
    metrics::counter!("onnx_serving_requests_total",
        "protocol" => protocol,
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a completed prediction
pub fn record_prediction(duration: Duration, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("onnx_serving_predictions_total", "outcome" => outcome).increment(1);
    metrics::histogram!("onnx_serving_prediction_duration_seconds").record(duration.as_secs_f64());
}

pub fn connection_opened() {
    metrics::gauge!("onnx_serving_open_connections").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("onnx_serving_open_connections").decrement(1.0);
}
