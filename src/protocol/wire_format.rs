//! Wire format encoding and decoding.
//!
//! Implements the 12-byte frame header:
//! ```text
//! ┌──────┬────────────────┬──────────┬───────────┬────────────────┐
//! │ Type │ Payload conn id│ Reserved │ Stream ID │ Payload length │
//! │ u8   │ u16 LE         │ u8 (= 0) │ u32 LE    │ u32 LE         │
//! └──────┴────────────────┴──────────┴───────────┴────────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. `payload_length` is the
//! unpadded logical length; padding only exists on data connections.

use std::fmt;

use crate::error::DecodeError;

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Connection id meaning "payload follows the header on the control connection".
pub const INLINE_CONNECTION_ID: u16 = 0;

/// Frame type byte.
///
/// Unknown bytes are preserved in [`FrameType::Unknown`] so a reader can skip
/// frames introduced by newer peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Settings,
    ClientInitialMetadata,
    ClientEndOfStream,
    ServerInitialMetadata,
    ServerTrailingMetadata,
    Message,
    BeginMessage,
    MessageChunk,
    Cancel,
    Unknown(u8),
}

impl FrameType {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FrameType::Settings,
            0x80 => FrameType::ClientInitialMetadata,
            0x81 => FrameType::ClientEndOfStream,
            0x91 => FrameType::ServerInitialMetadata,
            0x92 => FrameType::ServerTrailingMetadata,
            0xA0 => FrameType::Message,
            0xA1 => FrameType::BeginMessage,
            0xA2 => FrameType::MessageChunk,
            0xFF => FrameType::Cancel,
            other => FrameType::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            FrameType::Settings => 0x00,
            FrameType::ClientInitialMetadata => 0x80,
            FrameType::ClientEndOfStream => 0x81,
            FrameType::ServerInitialMetadata => 0x91,
            FrameType::ServerTrailingMetadata => 0x92,
            FrameType::Message => 0xA0,
            FrameType::BeginMessage => 0xA1,
            FrameType::MessageChunk => 0xA2,
            FrameType::Cancel => 0xFF,
            FrameType::Unknown(other) => other,
        }
    }

    /// Transport-scoped frames carry stream id 0.
    #[inline]
    pub const fn is_transport_scoped(self) -> bool {
        matches!(self, FrameType::Settings)
    }
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        FrameType::from_u8(value)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Settings => f.write_str("Settings"),
            FrameType::ClientInitialMetadata => f.write_str("ClientInitialMetadata"),
            FrameType::ClientEndOfStream => f.write_str("ClientEndOfStream"),
            FrameType::ServerInitialMetadata => f.write_str("ServerInitialMetadata"),
            FrameType::ServerTrailingMetadata => f.write_str("ServerTrailingMetadata"),
            FrameType::Message => f.write_str("Message"),
            FrameType::BeginMessage => f.write_str("BeginMessage"),
            FrameType::MessageChunk => f.write_str("MessageChunk"),
            FrameType::Cancel => f.write_str("Cancel"),
            FrameType::Unknown(b) => write!(f, "Unknown({:#04x})", b),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// 0 = inline on control, `N + 1` = data connection `N`.
    pub payload_connection_id: u16,
    /// 0 is reserved for transport-scoped frames.
    pub stream_id: u32,
    /// Unpadded payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a header with an inline payload.
    pub fn new(frame_type: FrameType, stream_id: u32, payload_length: u32) -> Self {
        Self {
            frame_type,
            payload_connection_id: INLINE_CONNECTION_ID,
            stream_id,
            payload_length,
        }
    }

    /// Same header, payload moved to data connection `index`.
    ///
    /// `None` when `index` has no connection id on the wire.
    pub fn with_data_connection(mut self, index: usize) -> Option<Self> {
        self.payload_connection_id = u16::try_from(index.checked_add(1)?).ok()?;
        Some(self)
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use chaotic_good::protocol::{FrameHeader, FrameType};
    ///
    /// let header = FrameHeader::new(FrameType::Cancel, 7, 0);
    /// assert_eq!(header.serialize(), [0xFF, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0]);
    /// ```
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.serialize_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn serialize_into(&self, buf: &mut [u8]) {
        buf[0] = self.frame_type.as_u8();
        buf[1..3].copy_from_slice(&self.payload_connection_id.to_le_bytes());
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Consumes exactly `HEADER_SIZE` bytes; trailing bytes are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::ShortHeader {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[3] != 0 {
            return Err(DecodeError::ReservedByteSet(buf[3]));
        }
        Ok(Self {
            frame_type: FrameType::from_u8(buf[0]),
            payload_connection_id: u16::from_le_bytes([buf[1], buf[2]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            payload_length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Bytes needed to round `payload_length` up to a multiple of `alignment`.
    ///
    /// Alignments of 0 and 1 never pad.
    #[inline]
    pub fn padding(&self, alignment: u32) -> u32 {
        padding_for(self.payload_length as usize, alignment as usize) as u32
    }

    /// Index of the data connection carrying the payload, if any.
    #[inline]
    pub fn data_connection(&self) -> Option<usize> {
        match self.payload_connection_id {
            INLINE_CONNECTION_ID => None,
            id => Some(id as usize - 1),
        }
    }

    /// Check stream-id/type consistency.
    ///
    /// Unknown frame types are legal: they are skipped, not interpreted.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if let FrameType::Unknown(_) = self.frame_type {
            return Ok(());
        }
        if self.frame_type.is_transport_scoped() != (self.stream_id == 0) {
            return Err(DecodeError::IllegalStreamId {
                frame_type: self.frame_type,
                stream_id: self.stream_id,
            });
        }
        Ok(())
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{stream_id={}, payload_length={}, payload_connection_id={}}}",
            self.frame_type, self.stream_id, self.payload_length, self.payload_connection_id
        )
    }
}

/// `round_up(len, alignment) - len`.
#[inline]
pub fn padding_for(len: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return 0;
    }
    match len % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}
