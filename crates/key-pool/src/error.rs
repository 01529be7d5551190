//! Error types for key pool operations

/// Errors from key pool construction and feedback.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool requires at least one API key")]
    EmptyPool,

    #[error("duplicate API key {label} at slot {slot}")]
    DuplicateKey { slot: usize, label: String },

    #[error("API key not in pool: {0}")]
    UnknownKey(String),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
