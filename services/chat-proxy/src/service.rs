//! Service lifecycle state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Request counters shared between the proxy handler and the health endpoint
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Service states.
///
/// `listen_addr` and `deadline` are carried for logging via `Debug`; nothing
/// reads them independently.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config, building the key pool
    Initializing,
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Accepting and proxying requests
    Running { listen_addr: SocketAddr },
    /// Graceful shutdown, finishing in-flight requests
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
}

/// Events that drive state transitions.
///
/// The `ConfigError` message is carried for `Debug` logging only.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceEvent {
    /// Configuration parsed and key pool built
    ConfigLoaded { listen_addr: SocketAddr },
    /// Configuration invalid (e.g. no API keys); fatal
    ConfigError(String),
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// All in-flight requests finished
    DrainComplete,
    /// Drain deadline exceeded
    DrainTimeout,
}

/// Actions the caller should execute after a state transition
#[derive(Debug)]
pub enum ServiceAction {
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Stop accepting and wait at most `timeout` for in-flight requests
    BeginDrain { timeout: Duration },
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Drain timeout duration (graceful shutdown <5s)
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { listen_addr }) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (ServiceState::Initializing, ServiceEvent::ConfigError(_)) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => (
            ServiceState::Running { listen_addr },
            ServiceAction::None,
        ),

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::BeginDrain {
                timeout: DRAIN_TIMEOUT,
            },
        ),

        // --- Draining ---
        (
            ServiceState::Draining { .. },
            ServiceEvent::DrainComplete | ServiceEvent::DrainTimeout,
        ) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Any other state + shutdown = stop ---
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
