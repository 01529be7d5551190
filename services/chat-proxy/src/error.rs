//! Service-specific error types

use std::net::SocketAddr;

use thiserror::Error;

/// Startup errors. All of them are fatal: the process must not start.
///
/// Per-request failures (rate limits, upstream errors, internal faults) are
/// turned into HTTP responses by the proxy handler and never propagate as
/// Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("invalid key pool: {0}")]
    Pool(#[from] key_pool::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
