//! Transport configuration and settings negotiation.
//!
//! [`TransportConfig`] holds local preferences. It is turned into the
//! immutable [`NegotiatedConfig`] once the peer's [`Settings`] frame has been
//! received; everything downstream (transport, chunker, data endpoints) only
//! ever sees the negotiated value.
//!
//! # Example
//!
//! ```
//! use chaotic_good::config::TransportConfig;
//!
//! let config = TransportConfig::from_json(r#"{ "alignment": 16, "max_send_chunk_size": 4096 }"#).unwrap();
//! assert_eq!(config.alignment, 16);
//! assert_eq!(config.max_send_chunk_size, 4096);
//! // Unspecified fields keep their defaults.
//! assert!(config.supports_chunking);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::Settings;

/// Default payload alignment on data connections.
pub const DEFAULT_ALIGNMENT: u32 = 64;

/// Default maximum chunk size in either direction (1 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// Payloads smaller than this stay on the control connection (8 KiB).
pub const DEFAULT_INLINE_PAYLOAD_THRESHOLD: usize = 8 * 1024;

/// Default per-data-connection output buffer (1 MiB).
pub const DEFAULT_DATA_CONNECTION_BUFFER: usize = 1024 * 1024;

/// Default capacity of the shared outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default maximum concurrently running server stream handlers.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 256;

/// Default bound on events buffered per call before the call is failed.
pub const DEFAULT_CALL_EVENT_BUFFER: usize = 1024;

/// Default largest frame payload accepted from the peer (64 MiB).
pub const DEFAULT_MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Local transport preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Alignment we ask the peer to pad offloaded payloads to.
    pub alignment: u32,
    /// Largest chunk we are willing to send.
    pub max_send_chunk_size: u32,
    /// Largest chunk we are willing to receive (declared in Settings).
    pub max_recv_chunk_size: u32,
    /// Whether we speak BeginMessage/MessageChunk at all.
    pub supports_chunking: bool,
    /// Payloads below this size are never offloaded.
    pub inline_payload_threshold: usize,
    /// Bytes buffered per data connection before writers suspend.
    pub data_connection_buffer: usize,
    /// Frames buffered in the outbound queue before senders suspend.
    pub outbound_queue_capacity: usize,
    /// Server-side cap on concurrently running stream handlers.
    pub max_concurrent_streams: usize,
    /// Inbound events a call may hold unread; overflowing fails that call.
    pub call_event_buffer: usize,
    /// Headers announcing a larger payload are treated as a fatal decode error.
    pub max_frame_payload: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            max_send_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_recv_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            supports_chunking: true,
            inline_payload_threshold: DEFAULT_INLINE_PAYLOAD_THRESHOLD,
            data_connection_buffer: DEFAULT_DATA_CONNECTION_BUFFER,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            call_event_buffer: DEFAULT_CALL_EVENT_BUFFER,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }
}

impl TransportConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The Settings frame body this side sends to its peer.
    pub fn local_settings(&self, data_connection_ids: Vec<String>) -> Settings {
        Settings {
            alignment: self.alignment.max(1),
            max_chunk_size: if self.supports_chunking {
                self.max_recv_chunk_size
            } else {
                0
            },
            supports_chunking: self.supports_chunking,
            data_connection_ids,
        }
    }

    /// Combine local preferences with the peer's declaration.
    ///
    /// If either side lacks chunking support or declares a zero chunk size,
    /// both directions fall back to whole-message framing.
    pub fn negotiate(&self, peer: &Settings) -> NegotiatedConfig {
        let chunking = self.supports_chunking
            && peer.supports_chunking
            && self.max_send_chunk_size > 0
            && self.max_recv_chunk_size > 0
            && peer.max_chunk_size > 0;

        let (max_send_chunk_size, max_recv_chunk_size) = if chunking {
            (
                self.max_send_chunk_size.min(peer.max_chunk_size),
                self.max_recv_chunk_size,
            )
        } else {
            (0, 0)
        };

        NegotiatedConfig {
            encode_alignment: peer.alignment.max(1),
            decode_alignment: self.alignment.max(1),
            max_send_chunk_size,
            max_recv_chunk_size,
            inline_payload_threshold: self.inline_payload_threshold,
            data_connection_buffer: self.data_connection_buffer.max(1),
            outbound_queue_capacity: self.outbound_queue_capacity.max(1),
            max_concurrent_streams: self.max_concurrent_streams.max(1),
            call_event_buffer: self.call_event_buffer.max(1),
            max_frame_payload: self.max_frame_payload.max(1),
        }
    }
}

/// Immutable per-transport configuration after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedConfig {
    /// Padding applied to payloads we offload (the peer's decode alignment).
    pub encode_alignment: u32,
    /// Padding we expect on payloads the peer offloads.
    pub decode_alignment: u32,
    /// 0 = send whole `Message` frames.
    pub max_send_chunk_size: u32,
    /// Largest `MessageChunk` accepted; 0 = chunking not negotiated.
    pub max_recv_chunk_size: u32,
    pub inline_payload_threshold: usize,
    pub data_connection_buffer: usize,
    pub outbound_queue_capacity: usize,
    pub max_concurrent_streams: usize,
    pub call_event_buffer: usize,
    pub max_frame_payload: u32,
}

impl NegotiatedConfig {
    /// Negotiate a config against a peer with identical preferences.
    pub fn symmetric(config: &TransportConfig) -> Self {
        config.negotiate(&config.local_settings(Vec::new()))
    }
}

impl Default for NegotiatedConfig {
    fn default() -> Self {
        Self::symmetric(&TransportConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(alignment: u32, max_chunk_size: u32, supports_chunking: bool) -> Settings {
        Settings {
            alignment,
            max_chunk_size,
            supports_chunking,
            data_connection_ids: Vec::new(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.alignment, DEFAULT_ALIGNMENT);
        assert_eq!(config.data_connection_buffer, 1024 * 1024);
        assert!(config.supports_chunking);
        assert_eq!(config.call_event_buffer, DEFAULT_CALL_EVENT_BUFFER);
        assert_eq!(config.max_frame_payload, DEFAULT_MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn test_limits_are_clamped_to_one() {
        let local = TransportConfig {
            call_event_buffer: 0,
            max_frame_payload: 0,
            ..Default::default()
        };
        let negotiated = NegotiatedConfig::symmetric(&local);
        assert_eq!(negotiated.call_event_buffer, 1);
        assert_eq!(negotiated.max_frame_payload, 1);
    }

    #[test]
    fn test_send_chunk_size_is_min_of_both() {
        let local = TransportConfig {
            max_send_chunk_size: 4096,
            ..Default::default()
        };
        let negotiated = local.negotiate(&peer(8, 1024, true));
        assert_eq!(negotiated.max_send_chunk_size, 1024);

        let negotiated = local.negotiate(&peer(8, 1 << 20, true));
        assert_eq!(negotiated.max_send_chunk_size, 4096);
    }

    #[test]
    fn test_chunking_falls_back_when_peer_declares_zero() {
        let negotiated = TransportConfig::default().negotiate(&peer(8, 0, true));
        assert_eq!(negotiated.max_send_chunk_size, 0);
        assert_eq!(negotiated.max_recv_chunk_size, 0);
    }

    #[test]
    fn test_chunking_falls_back_when_unsupported() {
        let negotiated = TransportConfig::default().negotiate(&peer(8, 1024, false));
        assert_eq!(negotiated.max_send_chunk_size, 0);

        let local = TransportConfig {
            supports_chunking: false,
            ..Default::default()
        };
        let negotiated = local.negotiate(&peer(8, 1024, true));
        assert_eq!(negotiated.max_send_chunk_size, 0);
        assert_eq!(negotiated.max_recv_chunk_size, 0);
        assert_eq!(local.local_settings(Vec::new()).max_chunk_size, 0);
    }

    #[test]
    fn test_alignment_is_symmetric() {
        let local = TransportConfig {
            alignment: 16,
            ..Default::default()
        };
        let negotiated = local.negotiate(&peer(256, 1024, true));
        assert_eq!(negotiated.encode_alignment, 256);
        assert_eq!(negotiated.decode_alignment, 16);
    }

    #[test]
    fn test_zero_alignment_means_unpadded() {
        let local = TransportConfig {
            alignment: 0,
            ..Default::default()
        };
        let negotiated = local.negotiate(&peer(0, 1024, true));
        assert_eq!(negotiated.encode_alignment, 1);
        assert_eq!(negotiated.decode_alignment, 1);
    }

    #[test]
    fn test_from_json_rejects_bad_types() {
        assert!(TransportConfig::from_json(r#"{ "alignment": "wide" }"#).is_err());
    }

    #[test]
    fn test_from_json_roundtrip() {
        let config = TransportConfig {
            inline_payload_threshold: 0,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(TransportConfig::from_json(&json).unwrap(), config);
    }
}
