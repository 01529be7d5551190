//! Prometheus metrics exposition
//!
//! Service-level metrics:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//!
//! The key pool records `key_pool_rate_limited_total` and
//! `key_pool_forced_evictions_total` through the same global recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_DURATION: &str = "proxy_request_duration_seconds";

/// Histogram buckets from 5ms up to the default 60s upstream timeout.
/// Retried requests can exceed a single timeout; those land in +Inf.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Upstream error labels for `proxy_upstream_errors_total`.
pub mod error_type {
    /// 429 or rate-limit transport error; the request was retried
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const TIMEOUT: &str = "timeout";
    pub const CONNECTION: &str = "connection";
    /// Non-429 error status from upstream
    pub const STATUS: &str = "status";
    /// Every attempt for the request was rate limited
    pub const EXHAUSTED: &str = "exhausted";
}

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Explicit buckets make `proxy_request_duration_seconds` render as a
/// histogram (`_bucket` lines) rather than the default summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "proxy_requests_total",
        "status" => status_str.clone(),
        "method" => method.to_string()
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION, "status" => status_str).record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}
