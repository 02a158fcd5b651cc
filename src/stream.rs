//! Stream registry.
//!
//! Maps stream ids to the push side of their logical call plus the per-stream
//! reassembly state. Lookups happen on the read loop; inserts and removals
//! also come from calls. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Status;
use crate::message::MessageReassembly;
use crate::protocol::Metadata;

/// Something that happened on a call, as observed by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    InitialMetadata(Metadata),
    Message(Bytes),
    TrailingMetadata(Metadata),
    /// The client finished sending (server side only).
    EndOfStream,
    /// Terminal: the call was cancelled or failed.
    Cancelled(Status),
}

/// Push side of a call.
///
/// Holds up to `capacity` unread events. One extra slot stays free for the
/// terminal event, so a call that fell behind can still be finished or
/// cancelled.
#[derive(Debug, Clone)]
pub(crate) struct CallSink {
    tx: mpsc::Sender<CallEvent>,
}

impl CallSink {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<CallEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        (Self { tx }, rx)
    }

    // False when the buffer is full. A closed receiver means the application
    // dropped the call; events for it are discarded.
    fn push(&self, event: CallEvent) -> bool {
        if self.tx.is_closed() {
            return true;
        }
        if self.tx.capacity() <= 1 {
            return false;
        }
        let _ = self.tx.try_send(event);
        true
    }

    // Terminal events may take the reserved slot.
    fn finish(&self, event: CallEvent) {
        let _ = self.tx.try_send(event);
    }

    #[must_use]
    pub(crate) fn push_initial_metadata(&self, metadata: Metadata) -> bool {
        self.push(CallEvent::InitialMetadata(metadata))
    }

    #[must_use]
    pub(crate) fn push_message(&self, message: Bytes) -> bool {
        self.push(CallEvent::Message(message))
    }

    #[must_use]
    pub(crate) fn push_end_of_stream(&self) -> bool {
        self.push(CallEvent::EndOfStream)
    }

    pub(crate) fn push_trailing_metadata(&self, metadata: Metadata) {
        self.finish(CallEvent::TrailingMetadata(metadata));
    }

    pub(crate) fn cancel(&self, status: Status) {
        self.finish(CallEvent::Cancelled(status));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    /// The client half is closed.
    Closing,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) sink: CallSink,
    pub(crate) reassembly: MessageReassembly,
    pub(crate) state: StreamState,
}

impl Stream {
    fn new(sink: CallSink) -> Self {
        Self {
            sink,
            reassembly: MessageReassembly::new(),
            state: StreamState::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum RegistryError {
    #[error("stream id {stream_id} is not greater than the last stream id {last}")]
    NotIncreasing { stream_id: u32, last: u32 },

    #[error("stream id {0} is already in use")]
    Duplicate(u32),

    #[error("stream id 0 is reserved")]
    ReservedId,

    #[error("transport is shut down")]
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<u32, Stream>,
    last_stream_id: u32,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    inner: Mutex<Inner>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new stream. Ids must strictly increase.
    pub(crate) fn insert(&self, stream_id: u32, sink: CallSink) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if stream_id == 0 {
            return Err(RegistryError::ReservedId);
        }
        if inner.streams.contains_key(&stream_id) {
            return Err(RegistryError::Duplicate(stream_id));
        }
        if stream_id <= inner.last_stream_id {
            return Err(RegistryError::NotIncreasing {
                stream_id,
                last: inner.last_stream_id,
            });
        }
        inner.last_stream_id = stream_id;
        inner.streams.insert(stream_id, Stream::new(sink));
        Ok(())
    }

    /// Run `f` on the stream under the lock; `None` if absent.
    pub(crate) fn with_stream<R>(&self, stream_id: u32, f: impl FnOnce(&mut Stream) -> R) -> Option<R> {
        self.lock().streams.get_mut(&stream_id).map(f)
    }

    pub(crate) fn remove(&self, stream_id: u32) -> Option<Stream> {
        self.lock().streams.remove(&stream_id)
    }

    pub(crate) fn contains(&self, stream_id: u32) -> bool {
        self.lock().streams.contains_key(&stream_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().streams.len()
    }

    /// Take every stream and refuse new ones from now on.
    pub(crate) fn drain(&self) -> Vec<Stream> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.streams.drain().map(|(_, stream)| stream).collect()
    }
}
