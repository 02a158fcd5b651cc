//! Protocol module - wire format and frame types.
//!
//! This module implements the binary protocol shared by the control and
//! data connections:
//! - 12-byte frame header encoding/decoding and padding arithmetic
//! - Typed frames ([`Frame`]) with payload (de)serialization
//! - Metadata and settings bodies

mod frame;
mod metadata;
mod settings;
mod wire_format;

pub use frame::Frame;
pub use metadata::Metadata;
pub use settings::Settings;
pub use wire_format::{padding_for, FrameHeader, FrameType, HEADER_SIZE, INLINE_CONNECTION_ID};
