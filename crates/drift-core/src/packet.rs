//! Packet encoding and decoding for the DRIFT wire protocol.
//!
//! Every packet is a fixed 36-byte header followed by zero or more payload
//! bytes, one packet per datagram. All multi-byte fields are little-endian;
//! the layout is frozen, so peers on any host order interoperate.
//!
//! Header layout:
//!
//! ```text
//! offset  size  field
//!      0     1  type
//!      1     1  priority
//!      2     2  flags
//!      4     4  seq_id
//!      8     4  data_length (advisory; the datagram length is authoritative)
//!     12     8  file_size
//!     20     8  file_id
//!     28     4  checksum
//!     32     4  reserved (zero on send, ignored on receive)
//! ```

use crate::error::WireError;
use crate::{HEADER_SIZE, MAX_DATA};

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// File chunk payload
    Data = 0x01,
    /// Per-chunk selective acknowledgment
    Ack = 0x02,
    /// Transfer metadata (reserved)
    Meta = 0x03,
    /// Checkpoint exchange (reserved)
    Checkpoint = 0x04,
    /// Resume negotiation (reserved)
    Resume = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Meta),
            0x04 => Ok(Self::Checkpoint),
            0x05 => Ok(Self::Resume),
            _ => Err(WireError::UnknownPacketType(value)),
        }
    }
}

/// Transfer priority, carried in every packet and fed to congestion control
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Baseline service
    #[default]
    Normal = 0,
    /// Larger window growth cap, shorter retransmission timeout
    High = 1,
    /// Most aggressive window growth and retransmission
    Critical = 2,
}

impl TryFrom<u8> for Priority {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::High),
            2 => Ok(Self::Critical),
            _ => Err(WireError::UnknownPriority(value)),
        }
    }
}

/// Packet flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Peer requests a checkpoint of current progress
    pub const CHECKPOINT_REQUEST: u16 = 0x0001;
    /// Peer requests resumption from a checkpoint
    pub const RESUME_REQUEST: u16 = 0x0002;
    /// This chunk is the last of the file
    pub const FINAL_CHUNK: u16 = 0x0004;
    /// Request end-to-end integrity verification
    pub const INTEGRITY_CHECK: u16 = 0x0008;

    /// Create empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Reconstruct flags from their wire representation
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Add the final-chunk flag
    #[must_use]
    pub fn with_final_chunk(mut self) -> Self {
        self.0 |= Self::FINAL_CHUNK;
        self
    }

    /// Add the integrity-check flag
    #[must_use]
    pub fn with_integrity_check(mut self) -> Self {
        self.0 |= Self::INTEGRITY_CHECK;
        self
    }

    /// Check if the final-chunk flag is set
    #[must_use]
    pub fn is_final_chunk(&self) -> bool {
        self.0 & Self::FINAL_CHUNK != 0
    }

    /// Check if the integrity-check flag is set
    #[must_use]
    pub fn is_integrity_check(&self) -> bool {
        self.0 & Self::INTEGRITY_CHECK != 0
    }

    /// Get the raw bit value
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// A decoded protocol packet.
///
/// Packets are a tagged union over [`PacketType`]: one struct, discriminated
/// by the `packet_type` field, rather than a type per packet kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Packet type tag
    pub packet_type: PacketType,
    /// Transfer priority
    pub priority: Priority,
    /// Flag bitmap
    pub flags: PacketFlags,
    /// Chunk index for DATA/ACK; zero for META
    pub seq_id: u32,
    /// Advisory payload length; `data.len()` is authoritative after decode
    pub data_length: u32,
    /// Total file size in bytes
    pub file_size: u64,
    /// 64-bit transfer identifier
    pub file_id: u64,
    /// Checksum of the payload bytes
    pub checksum: u32,
    /// Payload
    pub data: Vec<u8>,
}

impl Default for PacketType {
    fn default() -> Self {
        Self::Data
    }
}

impl Packet {
    /// Build a DATA packet for one chunk of a transfer.
    #[must_use]
    pub fn data(
        priority: Priority,
        seq_id: u32,
        file_id: u64,
        file_size: u64,
        checksum: u32,
        flags: PacketFlags,
        data: Vec<u8>,
    ) -> Self {
        Self {
            packet_type: PacketType::Data,
            priority,
            flags,
            seq_id,
            data_length: data.len() as u32,
            file_size,
            file_id,
            checksum,
            data,
        }
    }

    /// Build an ACK packet for one chunk of a transfer.
    #[must_use]
    pub fn ack(priority: Priority, seq_id: u32, file_id: u64, file_size: u64) -> Self {
        Self {
            packet_type: PacketType::Ack,
            priority,
            flags: PacketFlags::new(),
            seq_id,
            data_length: 0,
            file_size,
            file_id,
            checksum: 0,
            data: Vec::new(),
        }
    }

    /// Encode the packet into a wire buffer of `HEADER_SIZE + data.len()`
    /// bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());

        buf.push(self.packet_type as u8);
        buf.push(self.priority as u8);
        buf.extend_from_slice(&self.flags.as_u16().to_le_bytes());
        buf.extend_from_slice(&self.seq_id.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
        buf.extend_from_slice(&self.file_size.to_le_bytes());
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // reserved

        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a packet from a received datagram.
    ///
    /// The payload is everything past the header; the `data_length` field is
    /// carried through but never trusted past the datagram boundary.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if the buffer cannot hold a header,
    /// [`WireError::UnknownPacketType`] / [`WireError::UnknownPriority`] for
    /// unrecognized tag bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let packet_type = PacketType::try_from(buf[0])?;
        let priority = Priority::try_from(buf[1])?;
        let flags = PacketFlags::from_bits(u16::from_le_bytes([buf[2], buf[3]]));
        let seq_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let data_length = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let file_size = u64::from_le_bytes([
            buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
        ]);
        let file_id = u64::from_le_bytes([
            buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
        ]);
        let checksum = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        // bytes 32..36 reserved, ignored

        Ok(Self {
            packet_type,
            priority,
            flags,
            seq_id,
            data_length,
            file_size,
            file_id,
            checksum,
            data: buf[HEADER_SIZE..].to_vec(),
        })
    }

    /// Total encoded size of this packet.
    #[must_use]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Whether the payload fits the protocol's datagram budget.
    #[must_use]
    pub fn fits_datagram(&self) -> bool {
        self.data.len() <= MAX_DATA
    }
}
