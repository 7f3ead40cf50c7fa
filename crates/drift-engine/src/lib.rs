//! # DRIFT Engine
//!
//! The transfer engine proper: per-file transfer contexts, the four
//! cooperating loops (sender, receive pump, retransmit, telemetry), ACK
//! dispatch, durable pause/resume checkpoints, and the receive-side server
//! that reassembles files and acknowledges chunks.
//!
//! The engine's programmatic boundary is intentionally small:
//! [`TransferEngine::start_transfer`], [`TransferEngine::pause_transfer`],
//! [`TransferEngine::resume_transfer`], [`TransferEngine::get_stats`], and
//! [`TransferEngine::stop`]. Everything recoverable is recovered inside the
//! loop that observed it; once a transfer is admitted, its failures surface
//! through stats, never as errors.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod context;
pub mod engine;
pub mod error;
pub mod receiver;

pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use context::{StatsSnapshot, TransferContext, TransferStats};
pub use engine::{EngineConfig, TransferEngine};
pub use error::{EngineError, Result};
pub use receiver::{ReceiveConfig, ReceiveServer};

/// Default chunk payload size for engine transfers: the wire maximum.
pub const CHUNK_SIZE: usize = drift_core::MAX_DATA;
