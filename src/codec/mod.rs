//! Codec module - serialization of structured frame bodies.
//!
//! [`MsgPackCodec`] encodes the bodies of metadata and settings frames.
//! Message payloads are opaque bytes and never pass through a codec.

mod msgpack;

pub use msgpack::MsgPackCodec;
