//! Typed frames.
//!
//! [`Frame`] is a closed enum over every frame type this implementation
//! speaks. Payloads are `bytes::Bytes` so message bodies move through the
//! pipeline without copies.
//!
//! # Example
//!
//! ```
//! use chaotic_good::protocol::Frame;
//! use bytes::Bytes;
//!
//! let frame = Frame::Message { stream_id: 1, payload: Bytes::from_static(b"hello") };
//! let (header, payload) = frame.encode().unwrap();
//! assert_eq!(header.payload_length, 5);
//! assert_eq!(Frame::deserialize(&header, payload).unwrap(), frame);
//! ```

use std::fmt;

use bytes::Bytes;

use super::metadata::Metadata;
use super::settings::Settings;
use super::wire_format::{FrameHeader, FrameType};
use crate::error::{ChaoticGoodError, DecodeError, Result};

/// Size of the BeginMessage body (u64 LE total length).
const BEGIN_MESSAGE_BODY_SIZE: usize = 8;

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Negotiated capabilities (stream id 0).
    Settings(Settings),
    ClientInitialMetadata { stream_id: u32, metadata: Metadata },
    ServerInitialMetadata { stream_id: u32, metadata: Metadata },
    ServerTrailingMetadata { stream_id: u32, metadata: Metadata },
    /// Announces a chunked message of `length` bytes.
    BeginMessage { stream_id: u32, length: u64 },
    /// One slice of a chunked message.
    MessageChunk { stream_id: u32, payload: Bytes },
    /// A whole message in one frame.
    Message { stream_id: u32, payload: Bytes },
    ClientEndOfStream { stream_id: u32 },
    Cancel { stream_id: u32 },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Settings(_) => FrameType::Settings,
            Frame::ClientInitialMetadata { .. } => FrameType::ClientInitialMetadata,
            Frame::ServerInitialMetadata { .. } => FrameType::ServerInitialMetadata,
            Frame::ServerTrailingMetadata { .. } => FrameType::ServerTrailingMetadata,
            Frame::BeginMessage { .. } => FrameType::BeginMessage,
            Frame::MessageChunk { .. } => FrameType::MessageChunk,
            Frame::Message { .. } => FrameType::Message,
            Frame::ClientEndOfStream { .. } => FrameType::ClientEndOfStream,
            Frame::Cancel { .. } => FrameType::Cancel,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Settings(_) => 0,
            Frame::ClientInitialMetadata { stream_id, .. }
            | Frame::ServerInitialMetadata { stream_id, .. }
            | Frame::ServerTrailingMetadata { stream_id, .. }
            | Frame::BeginMessage { stream_id, .. }
            | Frame::MessageChunk { stream_id, .. }
            | Frame::Message { stream_id, .. }
            | Frame::ClientEndOfStream { stream_id }
            | Frame::Cancel { stream_id } => *stream_id,
        }
    }

    /// Serialize the payload body.
    pub fn serialize_payload(&self) -> Result<Bytes> {
        let body = match self {
            Frame::Settings(settings) => Bytes::from(settings.encode()?),
            Frame::ClientInitialMetadata { metadata, .. }
            | Frame::ServerInitialMetadata { metadata, .. }
            | Frame::ServerTrailingMetadata { metadata, .. } => Bytes::from(metadata.encode()?),
            Frame::BeginMessage { length, .. } => {
                Bytes::copy_from_slice(&length.to_le_bytes())
            }
            Frame::MessageChunk { payload, .. } | Frame::Message { payload, .. } => {
                payload.clone()
            }
            Frame::ClientEndOfStream { .. } | Frame::Cancel { .. } => Bytes::new(),
        };
        Ok(body)
    }

    /// Build the inline header describing this frame.
    pub fn make_header(&self) -> Result<FrameHeader> {
        Ok(self.encode()?.0)
    }

    /// Serialize once and return the matching header and body.
    pub fn encode(&self) -> Result<(FrameHeader, Bytes)> {
        let payload = self.serialize_payload()?;
        let payload_length = u32::try_from(payload.len()).map_err(|_| {
            ChaoticGoodError::Protocol(format!(
                "{} payload of {} bytes exceeds the 4 GiB frame limit",
                self.frame_type(),
                payload.len()
            ))
        })?;
        let header = FrameHeader::new(self.frame_type(), self.stream_id(), payload_length);
        Ok((header, payload))
    }

    /// Decode a frame from its header and unpadded payload.
    pub fn deserialize(header: &FrameHeader, payload: Bytes) -> std::result::Result<Self, DecodeError> {
        if payload.len() != header.payload_length as usize {
            return Err(DecodeError::InvalidPayloadLength {
                expected: header.payload_length,
                actual: payload.len(),
            });
        }
        header.validate()?;

        let stream_id = header.stream_id;
        let frame = match header.frame_type {
            FrameType::Settings => Frame::Settings(
                Settings::decode(&payload).map_err(|e| DecodeError::Malformed(e.to_string()))?,
            ),
            FrameType::ClientInitialMetadata => Frame::ClientInitialMetadata {
                stream_id,
                metadata: decode_metadata(&payload)?,
            },
            FrameType::ServerInitialMetadata => Frame::ServerInitialMetadata {
                stream_id,
                metadata: decode_metadata(&payload)?,
            },
            FrameType::ServerTrailingMetadata => Frame::ServerTrailingMetadata {
                stream_id,
                metadata: decode_metadata(&payload)?,
            },
            FrameType::BeginMessage => {
                let body: [u8; BEGIN_MESSAGE_BODY_SIZE] =
                    payload[..].try_into().map_err(|_| {
                        DecodeError::Malformed(format!(
                            "BeginMessage body must be {} bytes, got {}",
                            BEGIN_MESSAGE_BODY_SIZE,
                            payload.len()
                        ))
                    })?;
                Frame::BeginMessage {
                    stream_id,
                    length: u64::from_le_bytes(body),
                }
            }
            FrameType::MessageChunk => Frame::MessageChunk { stream_id, payload },
            FrameType::Message => Frame::Message { stream_id, payload },
            FrameType::ClientEndOfStream => {
                expect_empty(header, &payload)?;
                Frame::ClientEndOfStream { stream_id }
            }
            FrameType::Cancel => {
                expect_empty(header, &payload)?;
                Frame::Cancel { stream_id }
            }
            FrameType::Unknown(b) => return Err(DecodeError::UnknownFrameType(b)),
        };
        Ok(frame)
    }

    /// Stream-id/type consistency check.
    pub fn is_legal(&self) -> bool {
        self.frame_type().is_transport_scoped() == (self.stream_id() == 0)
    }
}

fn decode_metadata(payload: &[u8]) -> std::result::Result<Metadata, DecodeError> {
    Metadata::decode(payload).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn expect_empty(header: &FrameHeader, payload: &[u8]) -> std::result::Result<(), DecodeError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::Malformed(format!(
            "{} carries no payload, got {} bytes",
            header.frame_type,
            payload.len()
        )))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Settings(s) => write!(
                f,
                "Settings{{alignment={}, max_chunk_size={}, supports_chunking={}, data_connections={:?}}}",
                s.alignment, s.max_chunk_size, s.supports_chunking, s.data_connection_ids
            ),
            Frame::ClientInitialMetadata { stream_id, metadata }
            | Frame::ServerInitialMetadata { stream_id, metadata }
            | Frame::ServerTrailingMetadata { stream_id, metadata } => write!(
                f,
                "{}{{stream_id={}, entries={}}}",
                self.frame_type(),
                stream_id,
                metadata.len()
            ),
            Frame::BeginMessage { stream_id, length } => {
                write!(f, "BeginMessage{{stream_id={}, length={}}}", stream_id, length)
            }
            Frame::MessageChunk { stream_id, payload } | Frame::Message { stream_id, payload } => {
                write!(
                    f,
                    "{}{{stream_id={}, payload={}b}}",
                    self.frame_type(),
                    stream_id,
                    payload.len()
                )
            }
            Frame::ClientEndOfStream { stream_id } | Frame::Cancel { stream_id } => {
                write!(f, "{}{{stream_id={}}}", self.frame_type(), stream_id)
            }
        }
    }
}
