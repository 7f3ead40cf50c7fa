//! Error types for the DRIFT network endpoint.

use thiserror::Error;

/// Endpoint-level errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket creation or bind failed
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Operation on a closed endpoint
    #[error("endpoint closed")]
    Closed,

    /// Underlying socket I/O error
    #[error("socket i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, NetError>;
