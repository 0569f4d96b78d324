//! Error types for segreplay
//!
//! Only two failures are user visible: a malformed route identifier and a
//! failed initial load. Segments that are not loaded yet are not errors.

use thiserror::Error;

/// Main error type for the replay core
#[derive(Error, Debug)]
pub enum Error {
    /// Route identifier rejected before any provider was constructed
    #[error("Malformed route identifier: {reason}")]
    MalformedRoute { input: String, reason: String },

    /// Provider's initial load failed, nothing was started
    #[error("Failed to load route '{route}': {reason}")]
    LoadFailure { route: String, reason: String },

    /// Operation not allowed in the current stream state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Errors from the shared library (config, settings, I/O)
    #[error(transparent)]
    Common(#[from] segreplay_common::Error),
}

/// Convenience Result type using the segreplay Error
pub type Result<T> = std::result::Result<T, Error>;
