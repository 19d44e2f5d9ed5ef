//! Prometheus metrics wiring
//!
//! Installs the global recorder and names the metrics emitted by the
//! request pipeline. The returned handle renders the exposition format and
//! is handed to the external management collaborator.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::errors::{AppError, AppResult};

pub const REQUESTS_TOTAL: &str = "reproxy_http_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "reproxy_http_request_duration_seconds";
pub const THROTTLED_TOTAL: &str = "reproxy_http_throttled_total";

/// Install the Prometheus recorder. Call once at startup.
pub fn init() -> AppResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::internal(format!("metrics recorder: {e}")))?;

    describe_counter!(
        REQUESTS_TOTAL,
        "Requests served, by method, status and route"
    );
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        "Request latency in seconds, by route"
    );
    describe_counter!(THROTTLED_TOTAL, "Requests rejected by the throttle");

    Ok(handle)
}
