//! Receive-side state machine for chunked messages.
//!
//! ```text
//!                 BeginMessage(len)
//!  InMessageBoundary ───────────────► Receiving { remaining, accumulated }
//!        ▲                                   │
//!        └──── MessageChunk (remaining → 0) ─┘
//! ```
//!
//! Whole `Message` frames pass straight through while in a boundary. No I/O
//! happens here; the multiplexer feeds frames in and pushes the completed
//! messages into the call.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Largest declared message length accepted.
///
/// Keeps `remaining`/capacity arithmetic far away from overflow.
pub const MAX_MESSAGE_LENGTH: u64 = (usize::MAX / 2) as u64;

/// Upper bound on the buffer reserved up front for a chunked message.
const PREALLOCATE_LIMIT: u64 = 4 * 1024 * 1024;

/// Sequencing violations on one stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("BeginMessage received while {remaining} bytes of a chunked message are outstanding")]
    BeginWhileReceiving { remaining: u64 },

    #[error("BeginMessage declared a zero-length message")]
    EmptyMessage,

    #[error("BeginMessage length {0} exceeds the {} byte limit", MAX_MESSAGE_LENGTH)]
    TooLarge(u64),

    #[error("MessageChunk received without a preceding BeginMessage")]
    ChunkWithoutBegin,

    #[error("MessageChunk of {len} bytes overruns the {remaining} bytes remaining")]
    ChunkOverrun { len: usize, remaining: u64 },

    #[error("Message received while {remaining} bytes of a chunked message are outstanding")]
    MessageWhileReceiving { remaining: u64 },
}

#[derive(Debug, Default)]
enum State {
    #[default]
    InMessageBoundary,
    Receiving {
        remaining: u64,
        accumulated: BytesMut,
    },
}

/// Per-stream message reassembly.
#[derive(Debug, Default)]
pub struct MessageReassembly {
    state: State,
}

impl MessageReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between messages (the initial and terminal state).
    #[inline]
    pub fn in_message_boundary(&self) -> bool {
        matches!(self.state, State::InMessageBoundary)
    }

    /// Start a chunked message of `length` bytes.
    pub fn begin_message(&mut self, length: u64) -> Result<(), ReassemblyError> {
        if let State::Receiving { remaining, .. } = &self.state {
            return Err(ReassemblyError::BeginWhileReceiving {
                remaining: *remaining,
            });
        }
        if length == 0 {
            return Err(ReassemblyError::EmptyMessage);
        }
        if length > MAX_MESSAGE_LENGTH {
            return Err(ReassemblyError::TooLarge(length));
        }
        self.state = State::Receiving {
            remaining: length,
            accumulated: BytesMut::with_capacity(length.min(PREALLOCATE_LIMIT) as usize),
        };
        Ok(())
    }

    /// Consume one chunk; returns the whole message once the last byte arrives.
    pub fn message_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>, ReassemblyError> {
        let State::Receiving {
            remaining,
            accumulated,
        } = &mut self.state
        else {
            return Err(ReassemblyError::ChunkWithoutBegin);
        };

        let len = chunk.len() as u64;
        if len > *remaining {
            return Err(ReassemblyError::ChunkOverrun {
                len: chunk.len(),
                remaining: *remaining,
            });
        }
        *remaining -= len;

        if *remaining > 0 {
            accumulated.extend_from_slice(&chunk);
            return Ok(None);
        }

        let message = if accumulated.is_empty() {
            // Single-chunk message: hand the chunk through untouched.
            chunk
        } else {
            accumulated.extend_from_slice(&chunk);
            std::mem::take(accumulated).freeze()
        };
        self.state = State::InMessageBoundary;
        Ok(Some(message))
    }

    /// Accept a whole (unchunked) message.
    pub fn message(&mut self, payload: Bytes) -> Result<Bytes, ReassemblyError> {
        match &self.state {
            State::InMessageBoundary => Ok(payload),
            State::Receiving { remaining, .. } => Err(ReassemblyError::MessageWhileReceiving {
                remaining: *remaining,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_summing_to_length() {
        let mut r = MessageReassembly::new();
        r.begin_message(10).unwrap();
        assert!(!r.in_message_boundary());

        assert_eq!(r.message_chunk(Bytes::from_static(b"0123")).unwrap(), None);
        assert_eq!(r.message_chunk(Bytes::from_static(b"456")).unwrap(), None);
        let message = r.message_chunk(Bytes::from_static(b"789")).unwrap().unwrap();

        assert_eq!(&message[..], b"0123456789");
        assert!(r.in_message_boundary());
    }

    #[test]
    fn test_single_chunk_message() {
        let mut r = MessageReassembly::new();
        r.begin_message(5).unwrap();
        let chunk = Bytes::from_static(b"hello");
        let message = r.message_chunk(chunk.clone()).unwrap().unwrap();
        assert_eq!(message, chunk);
        assert_eq!(message.as_ptr(), chunk.as_ptr());
    }

    #[test]
    fn test_overrun_fails() {
        let mut r = MessageReassembly::new();
        r.begin_message(4).unwrap();
        r.message_chunk(Bytes::from_static(b"ab")).unwrap();
        let err = r.message_chunk(Bytes::from_static(b"cde")).unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::ChunkOverrun {
                len: 3,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_chunk_without_begin() {
        let mut r = MessageReassembly::new();
        assert_eq!(
            r.message_chunk(Bytes::from_static(b"x")).unwrap_err(),
            ReassemblyError::ChunkWithoutBegin
        );
    }

    #[test]
    fn test_begin_rules() {
        let mut r = MessageReassembly::new();
        assert_eq!(r.begin_message(0).unwrap_err(), ReassemblyError::EmptyMessage);
        assert_eq!(
            r.begin_message(MAX_MESSAGE_LENGTH + 1).unwrap_err(),
            ReassemblyError::TooLarge(MAX_MESSAGE_LENGTH + 1)
        );

        r.begin_message(8).unwrap();
        assert_eq!(
            r.begin_message(8).unwrap_err(),
            ReassemblyError::BeginWhileReceiving { remaining: 8 }
        );
    }

    #[test]
    fn test_whole_message_only_at_boundary() {
        let mut r = MessageReassembly::new();
        let payload = Bytes::from_static(b"whole");
        assert_eq!(r.message(payload.clone()).unwrap(), payload);
        assert!(r.in_message_boundary());

        r.begin_message(3).unwrap();
        assert_eq!(
            r.message(payload).unwrap_err(),
            ReassemblyError::MessageWhileReceiving { remaining: 3 }
        );
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut r = MessageReassembly::new();
        for round in 0..3u8 {
            r.begin_message(4).unwrap();
            r.message_chunk(Bytes::from(vec![round; 2])).unwrap();
            let message = r.message_chunk(Bytes::from(vec![round; 2])).unwrap().unwrap();
            assert_eq!(message.len(), 4);
            assert!(message.iter().all(|&b| b == round));
        }
    }

    #[test]
    fn test_reassembled_length_matches_declared() {
        // Chunk sizes that do not divide the total evenly.
        let total = 100_003u64;
        let mut r = MessageReassembly::new();
        r.begin_message(total).unwrap();

        let mut sent = 0u64;
        let mut result = None;
        for size in [1u64, 7, 4096, 65_536, 29_999, 455].iter().cycle() {
            let size = (*size).min(total - sent);
            sent += size;
            result = r.message_chunk(Bytes::from(vec![0u8; size as usize])).unwrap();
            if sent == total {
                break;
            }
        }
        assert_eq!(result.unwrap().len() as u64, total);
    }
}
