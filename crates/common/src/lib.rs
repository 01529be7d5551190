//! Shared types for the rotating chat proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
