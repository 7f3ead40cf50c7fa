//! Error types for the DRIFT wire protocol.

use thiserror::Error;

/// Wire-level decode errors.
///
/// A datagram that fails to decode is a protocol anomaly; receivers drop it
/// without touching any transfer state.
#[derive(Debug, Error)]
pub enum WireError {
    /// Datagram too short to hold a packet header
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum size required
        expected: usize,
        /// Size actually received
        actual: usize,
    },

    /// Unrecognized packet type byte
    #[error("unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    /// Unrecognized priority byte
    #[error("unknown priority: 0x{0:02X}")]
    UnknownPriority(u8),
}
