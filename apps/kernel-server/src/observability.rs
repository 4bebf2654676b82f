// [[AXON]]/apps/kernel-server/src/observability.rs
// Purpose: Prometheus metrics bootstrap and shared recording helpers.
// Architecture: Observability Layer
// Dependencies: metrics, metrics-exporter-prometheus

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the process-wide recorder. Called once at boot; the handle
/// renders the scrape body for GET /metrics on the admin port.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Per-request gateway metric, labeled by method and outcome.
pub fn record_request(method: &str, status: &'static str, duration: Duration) {
    metrics::histogram!(
        "request_duration_seconds",
        "method" => method.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
    metrics::counter!(
        "requests_total",
        "method" => method.to_string(),
        "status" => status
    )
    .increment(1);
}

pub fn record_queue_depth(queue: &'static str, depth: usize) {
    metrics::gauge!("queue_depth", "queue" => queue).set(depth as f64);
}

pub fn record_connections(count: usize) {
    metrics::gauge!("gateway_connections").set(count as f64);
}
