//! # DRIFT Files
//!
//! File-side support for the DRIFT transfer engine:
//! - Fixed-size chunking with on-demand reads and streaming
//! - Non-cryptographic integrity hashing (per-chunk checksum, whole-file
//!   digest)
//! - Offset-addressed reassembly for the receive side

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod integrity;

pub use chunker::{Chunk, FileReassembler};
pub use integrity::{file_hash, verify_chunk, xxhash32};

/// Default chunk size for the chunking utilities (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
