//! Error types for the Warden engine.

use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Malformed policy from the resolver (non-positive threshold/window,
    /// empty scope list). Fatal to the request; callers should fail closed.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// The backing store could not complete an operation within its timeout.
    /// Absorbed by the fail-safety path, never surfaced raw to end users.
    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    /// A scope was requested but no identifier is available for it
    /// (e.g., account scope on an unauthenticated request).
    #[error("Misconfiguration: {0}")]
    Misconfiguration(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store transport errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether this error should be absorbed by the fail-safety controller
    /// rather than propagated to the caller.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, WardenError::StoreUnavailable(_))
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
