//! Chat completion proxy with API key rotation
//!
//! Each inbound request runs a bounded acquire/attempt/report loop against the
//! key pool: a 429 (or a transport error carrying the `rate_limit` marker)
//! reports the key and retries with the next one. Anything else ends the loop.
//! The upstream body and status pass through unchanged on success.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use key_pool::{KeyPool, SelectedKey, UpstreamOutcome, classify_status, is_rate_limit_message};
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{self, error_type};

/// Largest inbound body accepted (10 MiB)
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Fixed message for internal faults; details stay in the logs.
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

const EXHAUSTED_MESSAGE: &str = "all upstream API keys are rate limited";

/// Longest upstream error body quoted back in an error message (64 KiB)
const MAX_ERROR_DETAIL_BYTES: usize = 64 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub pool: Arc<KeyPool>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// Terminal request failures. Rate limits are not here: they are retried
/// inside the loop and only surface as `Exhausted`.
#[derive(Debug)]
enum Failure {
    /// Fault in the proxy itself (unreadable or non-JSON body, bad key bytes).
    /// The detail is logged, never returned.
    Internal(String),
    /// Upstream error status or transport fault. `error_code` is the
    /// upstream status when one was received, else 500.
    Upstream { message: String, error_code: u16 },
    /// Every allowed attempt was rate limited
    Exhausted { attempts: u32 },
}

/// What to do after an attempt that got no usable HTTP response.
#[derive(Debug, PartialEq, Eq)]
enum TransportDecision {
    /// The error text names a rate limit: report the key, try the next one.
    Rotate,
    /// Anything else ends the request.
    Fail { message: String, error_code: u16 },
}

/// Classify a transport error from its rendered source chain and the upstream
/// status, if one was received.
fn transport_decision(description: &str, status: Option<u16>) -> TransportDecision {
    if is_rate_limit_message(description) {
        TransportDecision::Rotate
    } else {
        TransportDecision::Fail {
            message: format!("upstream request failed: {description}"),
            error_code: status.unwrap_or(500),
        }
    }
}

impl Failure {
    fn into_response(self, request_id: &str) -> Response {
        match self {
            Failure::Internal(detail) => {
                error!(error = %detail, "internal error while proxying request");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_ERROR_MESSAGE,
                    500,
                    request_id,
                )
            }
            Failure::Upstream {
                message,
                error_code,
            } => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &message,
                error_code,
                request_id,
            ),
            Failure::Exhausted { attempts } => {
                warn!(attempts, "all attempts rate limited, giving up");
                error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    EXHAUSTED_MESSAGE,
                    429,
                    request_id,
                )
            }
        }
    }
}

/// JSON error body: {"error": "<description>", "error_code": <int>}
fn error_response(
    status: StatusCode,
    message: &str,
    error_code: u16,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": message,
        "error_code": error_code,
    });
    (
        status,
        [
            (CONTENT_TYPE, "application/json"),
            (REQUEST_ID_HEADER, request_id),
        ],
        body.to_string(),
    )
        .into_response()
}

/// Proxy one chat completion request, rotating keys on rate limits.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn proxy_chat(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match forward(state, request, &request_id).await {
        Ok(response) => response,
        Err(failure) => failure.into_response(&request_id),
    };

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(status.as_u16(), &method, started.elapsed().as_secs_f64());
    response
}

async fn forward(
    state: &ProxyState,
    request: Request<Body>,
    request_id: &str,
) -> Result<Response, Failure> {
    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Failure::Internal(format!("failed to read request body: {e}")))?;

    // Forwarded verbatim, but it must at least be JSON.
    serde_json::from_slice::<serde::de::IgnoredAny>(&body)
        .map_err(|e| Failure::Internal(format!("request body is not valid JSON: {e}")))?;

    for attempt in 1..=state.max_attempts {
        let selected = state.pool.acquire().await;
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", selected.key.expose()))
            .map_err(|_| {
                Failure::Internal(format!(
                    "API key in slot {} is not a valid header value",
                    selected.slot
                ))
            })?;
        bearer.set_sensitive(true);

        debug!(attempt, slot = selected.slot, key = %selected.label, "forwarding to upstream");
        let result = state
            .client
            .post(&state.upstream_url)
            .header(AUTHORIZATION, bearer)
            .header(CONTENT_TYPE, "application/json")
            .timeout(state.timeout)
            .body(body.clone())
            .send()
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                let is_timeout = e.is_timeout();
                let status = e.status().map(|s| s.as_u16());
                let description = error_chain(&e.without_url());

                match transport_decision(&description, status) {
                    TransportDecision::Rotate => {
                        metrics::record_upstream_error(error_type::RATE_LIMITED);
                        info!(
                            attempt,
                            slot = selected.slot,
                            key = %selected.label,
                            error = %description,
                            "rate limit in transport error, rotating key"
                        );
                        report_limited(&state.pool, &selected).await;
                        continue;
                    }
                    TransportDecision::Fail {
                        message,
                        error_code,
                    } => {
                        metrics::record_upstream_error(if is_timeout {
                            error_type::TIMEOUT
                        } else {
                            error_type::CONNECTION
                        });
                        error!(
                            attempt,
                            slot = selected.slot,
                            error = %description,
                            "upstream request failed"
                        );
                        return Err(Failure::Upstream {
                            message,
                            error_code,
                        });
                    }
                }
            }
        };

        let status = upstream.status();
        match classify_status(status.as_u16()) {
            UpstreamOutcome::RateLimited => {
                metrics::record_upstream_error(error_type::RATE_LIMITED);
                info!(
                    attempt,
                    slot = selected.slot,
                    key = %selected.label,
                    "upstream returned 429, rotating key"
                );
                report_limited(&state.pool, &selected).await;
            }
            UpstreamOutcome::Failed => {
                metrics::record_upstream_error(error_type::STATUS);
                let detail = read_error_detail(upstream).await;
                warn!(
                    attempt,
                    slot = selected.slot,
                    status = status.as_u16(),
                    "upstream returned error status"
                );
                let message = if detail.trim().is_empty() {
                    format!("upstream returned {status}")
                } else {
                    format!("upstream returned {status}: {}", detail.trim())
                };
                return Err(Failure::Upstream {
                    message,
                    error_code: status.as_u16(),
                });
            }
            UpstreamOutcome::Success => {
                let content_type = upstream
                    .headers()
                    .get(CONTENT_TYPE)
                    .cloned()
                    .unwrap_or_else(|| HeaderValue::from_static("application/json"));
                let bytes = upstream.bytes().await.map_err(|e| {
                    metrics::record_upstream_error(error_type::CONNECTION);
                    Failure::Upstream {
                        message: format!(
                            "failed to read upstream response: {}",
                            error_chain(&e.without_url())
                        ),
                        error_code: status.as_u16(),
                    }
                })?;
                debug!(
                    attempt,
                    status = status.as_u16(),
                    bytes = bytes.len(),
                    "upstream succeeded"
                );
                return passthrough(status, content_type, bytes, request_id);
            }
        }
    }

    metrics::record_upstream_error(error_type::EXHAUSTED);
    Err(Failure::Exhausted {
        attempts: state.max_attempts,
    })
}

/// Report a rate-limited key. A rejected report is logged and otherwise ignored.
async fn report_limited(pool: &KeyPool, selected: &SelectedKey) {
    if let Err(e) = pool.report_limited(selected.key.expose()).await {
        warn!(slot = selected.slot, error = %e, "rate limit report rejected by pool");
    }
}

/// Read at most `MAX_ERROR_DETAIL_BYTES` of an upstream error body. A read
/// failure keeps whatever arrived before it.
async fn read_error_detail(mut upstream: reqwest::Response) -> String {
    let mut detail = Vec::new();
    loop {
        match upstream.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_ERROR_DETAIL_BYTES - detail.len();
                detail.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if detail.len() == MAX_ERROR_DETAIL_BYTES {
                    debug!(limit = MAX_ERROR_DETAIL_BYTES, "upstream error body truncated");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(
                    error = %error_chain(&e.without_url()),
                    "failed to read upstream error body"
                );
                break;
            }
        }
    }
    String::from_utf8_lossy(&detail).into_owned()
}

fn passthrough(
    status: StatusCode,
    content_type: HeaderValue,
    body: Bytes,
    request_id: &str,
) -> Result<Response, Failure> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(REQUEST_ID_HEADER, request_id)
        .body(Body::from(body))
        .map_err(|e| Failure::Internal(format!("response build error: {e}")))
}

/// Render an error with its full source chain. reqwest keeps the useful part
/// (e.g. the hyper or TLS cause) in `source()`, not in `Display`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        description.push_str(": ");
        description.push_str(&cause.to_string());
        source = cause.source();
    }
    description
}
