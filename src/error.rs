//! Error types for chaotic-good.
//!
//! Two layers of errors live here:
//!
//! - [`ChaoticGoodError`] / [`DecodeError`]: failures returned by the codec,
//!   the endpoints and the transport.
//! - [`Status`]: the terminal outcome delivered to a logical call when the
//!   multiplexer cancels it.

use std::fmt;

use thiserror::Error;

use crate::protocol::FrameType;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum ChaoticGoodError {
    /// I/O error on the control or a data connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration loading).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// A frame header or payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Protocol error (bad handshake, sequencing violation, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame referenced a data connection that does not exist.
    #[error("Unknown data connection index: {0}")]
    UnknownDataConnection(usize),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The stream has already completed or been cancelled.
    #[error("Stream {0} is closed")]
    StreamClosed(u32),

    /// The outbound frame queue is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The transport has been shut down.
    #[error("Transport shut down")]
    TransportShutdown,
}

/// Result type alias using ChaoticGoodError.
pub type Result<T> = std::result::Result<T, ChaoticGoodError>;

/// Wire-level decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than a full frame header.
    #[error("Frame header needs {expected} bytes, got {actual}")]
    ShortHeader { expected: usize, actual: usize },

    /// The reserved header byte was not zero.
    #[error("Non-zero reserved byte in frame header: {0:#04x}")]
    ReservedByteSet(u8),

    /// Payload length disagrees with the header.
    #[error("Invalid payload length: header says {expected}, got {actual}")]
    InvalidPayloadLength { expected: u32, actual: usize },

    /// Frame type byte is not one this implementation understands.
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Stream id is inconsistent with the frame type.
    #[error("Illegal stream id {stream_id} for {frame_type} frame")]
    IllegalStreamId { frame_type: FrameType, stream_id: u32 },

    /// Header announces a payload above the configured limit.
    #[error("Frame payload of {length} bytes exceeds the limit of {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    /// Payload body could not be parsed.
    #[error("Malformed frame payload: {0}")]
    Malformed(String),
}

/// Status codes delivered to cancelled or failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The call was cancelled by the peer or the application.
    Cancelled,
    /// A protocol violation was detected on the call's stream.
    Internal,
    /// The transport failed underneath the call.
    Unavailable,
    /// The peer refused the stream because it is at capacity.
    ResourceExhausted,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
        };
        f.write_str(name)
    }
}

/// Terminal status of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&ChaoticGoodError> for Status {
    fn from(err: &ChaoticGoodError) -> Self {
        Status::unavailable(err.to_string())
    }
}
