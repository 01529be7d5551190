//! Rotating Chat Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of upstream API keys
//! 2. Listens for chat completion requests on `POST /chat/`
//! 3. Forwards each request with a key from the pool
//! 4. Rotates to another key whenever the upstream rate-limits one

mod config;
mod error;
mod metrics;
mod proxy;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::KeyPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/chat/", post(chat_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Build the key pool from resolved configuration. Keys move out of the config.
fn build_pool(config: &mut Config) -> error::Result<Arc<KeyPool>> {
    let keys = std::mem::take(&mut config.pool.keys);
    let pool = KeyPool::new(keys, Duration::from_secs(config.pool.cooldown_secs))?;
    Ok(Arc::new(pool))
}

async fn bind_listener(addr: SocketAddr) -> error::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| error::Error::Bind { addr, source })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting rotating-chat-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // --- State: Initializing ---
    let state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    match &config_path {
        Some(path) => info!(path = %path.display(), "loading configuration"),
        None => info!("no config file found, using defaults"),
    }

    let loaded = Config::load(config_path.as_deref())
        .map_err(error::Error::from)
        .and_then(|mut config| {
            let pool = build_pool(&mut config)?;
            Ok((config, pool))
        });
    let (config, pool) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            let (_state, action) = handle_event(state, ServiceEvent::ConfigError(e.to_string()));
            error!(error = %e, ?action, "invalid configuration, refusing to start");
            return Err(e).context("startup configuration rejected");
        }
    };

    let max_attempts = config.max_attempts(pool.len());
    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        keys = pool.len(),
        cooldown_secs = config.pool.cooldown_secs,
        max_attempts,
        "configuration loaded"
    );

    // Transition: Initializing -> Starting
    let (state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.proxy.listen_addr,
        },
    );
    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        _ => anyhow::bail!("unexpected action after ConfigLoaded: {action:?}"),
    };

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        proxy: ProxyState {
            client: reqwest::Client::new(),
            upstream_url: config.proxy.upstream_url.clone(),
            pool,
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            max_attempts,
            requests_total: metrics.requests_total.clone(),
            errors_total: metrics.errors_total.clone(),
        },
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);
    let listener = bind_listener(listen_addr).await?;

    // Transition: Starting -> Running
    let (state, _action) = handle_event(state, ServiceEvent::ListenerReady);
    info!(addr = %listen_addr, "state: Running, accepting requests");

    // The drain timer starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the
    // timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Transition: Running -> Draining
    let (state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    let drain_timeout = match action {
        ServiceAction::BeginDrain { timeout } => timeout,
        _ => service::DRAIN_TIMEOUT,
    };
    let _ = shutdown_tx.send(());

    let drain_event = match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::DrainComplete
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::DrainComplete
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::DrainComplete
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    // Transition: Draining -> Stopped
    let (_state, action) = handle_event(state, drain_event);
    info!(
        ?action,
        requests_served = metrics.requests_total.load(Ordering::Relaxed),
        "shutdown complete"
    );
    Ok(())
}

/// Health endpoint: service counters plus the key pool summary.
/// Returns 200 while any key is eligible, 503 when every key is cooling down.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let pool = state.proxy.pool.health().await;

    let pool_status = pool["status"].as_str().unwrap_or("unhealthy").to_string();
    let status_code = if pool_status == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": pool_status,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "pool": pool,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// `POST /chat/`: forward to upstream with key rotation.
async fn chat_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_chat(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
