//! Error types for the DRIFT transfer engine.

use std::path::PathBuf;
use thiserror::Error;

/// Engine-level errors.
///
/// Only two classes escape the engine: failures that prevent constructing
/// it, and failures that prevent admitting a specific transfer. Everything
/// after admission is reported through stats.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Endpoint construction or bind failure
    #[error("network error: {0}")]
    Net(#[from] drift_net::NetError),

    /// Engine-level I/O failure (checkpoint directory, output directory)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint store failure at construction time
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// The transfer's source file cannot be opened
    #[error("cannot open source file {path}: {source}")]
    SourceFile {
        /// Path the caller asked to transfer
        path: PathBuf,
        /// Underlying open failure
        source: std::io::Error,
    },
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
