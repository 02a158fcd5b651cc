//! Send-side message splitting.
//!
//! With chunking negotiated, every non-empty message becomes one
//! `BeginMessage` followed by `MessageChunk`s of at most `max_chunk_size`
//! bytes. Chunk sizes are rounded down to the encode alignment when possible
//! so offloaded chunks need no padding except for the last one.

use bytes::Bytes;

use crate::config::NegotiatedConfig;
use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageChunker {
    max_chunk_size: u32,
    alignment: u32,
}

impl MessageChunker {
    /// `max_chunk_size == 0` disables chunking.
    pub fn new(max_chunk_size: u32, alignment: u32) -> Self {
        Self {
            max_chunk_size,
            alignment: alignment.max(1),
        }
    }

    pub fn from_config(config: &NegotiatedConfig) -> Self {
        Self::new(config.max_send_chunk_size, config.encode_alignment)
    }

    #[inline]
    pub fn is_chunking(&self) -> bool {
        self.max_chunk_size > 0
    }

    /// Effective chunk size in bytes.
    fn chunk_size(&self) -> usize {
        let max = self.max_chunk_size as usize;
        let alignment = self.alignment as usize;
        if max >= alignment {
            max - max % alignment
        } else {
            max
        }
    }

    /// Frames carrying `payload` on `stream_id`, in send order.
    pub fn frames(&self, stream_id: u32, payload: Bytes) -> Vec<Frame> {
        if !self.is_chunking() || payload.is_empty() {
            return vec![Frame::Message { stream_id, payload }];
        }

        let chunk_size = self.chunk_size();
        let mut frames = Vec::with_capacity(1 + payload.len().div_ceil(chunk_size));
        frames.push(Frame::BeginMessage {
            stream_id,
            length: payload.len() as u64,
        });

        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            frames.push(Frame::MessageChunk {
                stream_id,
                payload: payload.slice(offset..end),
            });
            offset = end;
        }
        frames
    }
}
