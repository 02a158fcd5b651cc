//! Transport settings exchanged once per connection pair.
//!
//! Each side sends one `Settings` frame (stream id 0) on the control
//! connection before any stream opens. See [`TransportConfig::negotiate`]
//! for how the two declarations combine.
//!
//! [`TransportConfig::negotiate`]: crate::config::TransportConfig::negotiate

use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Capabilities one side declares to its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Alignment the sender wants offloaded payloads padded to (its decode alignment).
    pub alignment: u32,
    /// Largest message chunk the sender accepts; 0 disables chunking.
    pub max_chunk_size: u32,
    /// Whether the sender understands BeginMessage/MessageChunk.
    pub supports_chunking: bool,
    /// Ids of the sender's data connections, in wire index order.
    #[serde(default)]
    pub data_connection_ids: Vec<String>,
}

impl Settings {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }
}
