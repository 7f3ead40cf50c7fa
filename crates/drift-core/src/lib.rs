//! # DRIFT Core
//!
//! Protocol layer for DRIFT (Datagram Reliable In-flight File Transfer).
//!
//! This crate provides:
//! - Packet encoding and decoding (fixed 36-byte header, little-endian)
//! - Loss/RTT-driven congestion control with priority biasing
//! - Protocol error types
//!
//! It is a leaf crate: no I/O, no runtime. The engine and endpoint crates
//! build on top of it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod congestion;
pub mod error;
pub mod packet;

pub use congestion::{CongestionControl, CongestionState};
pub use error::WireError;
pub use packet::{Packet, PacketFlags, PacketType, Priority};

/// Fixed packet header size in bytes
pub const HEADER_SIZE: usize = 36;

/// Maximum payload bytes per packet
pub const MAX_DATA: usize = 65_000;

/// Maximum total packet size (header + payload)
pub const MAX_PACKET: usize = HEADER_SIZE + MAX_DATA;
