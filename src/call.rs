//! Application-facing call handles.
//!
//! A call is one stream seen from the application. Outbound operations queue
//! frames on the transport's shared writer; inbound activity arrives as
//! [`CallEvent`]s. Dropping a call that is still registered cancels it and
//! tells the peer.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ChaoticGoodError, Result};
use crate::multiplex::TransportCore;
use crate::protocol::{Frame, Metadata};
use crate::stream::{CallEvent, StreamState};

/// Outbound side shared by both call kinds.
struct CallSender {
    stream_id: u32,
    core: Arc<TransportCore>,
}

impl CallSender {
    fn new(stream_id: u32, core: Arc<TransportCore>) -> Self {
        Self { stream_id, core }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.core.streams.contains(self.stream_id) {
            Ok(())
        } else {
            Err(ChaoticGoodError::StreamClosed(self.stream_id))
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.core.outbound.send(frame).await
    }

    async fn send_message(&self, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        for frame in self.core.chunker.frames(self.stream_id, payload) {
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Remove the stream and send Cancel if it was still live.
    fn cancel(&self) -> bool {
        if self.core.streams.remove(self.stream_id).is_some() {
            tracing::debug!("Cancelling stream {}", self.stream_id);
            self.core.send_cancel(self.stream_id);
            true
        } else {
            false
        }
    }
}

impl Drop for CallSender {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Client end of a call, returned by `ClientTransport::start_call`.
pub struct ClientCall {
    sender: CallSender,
    events: mpsc::Receiver<CallEvent>,
    half_closed: bool,
}

impl ClientCall {
    pub(crate) fn new(
        stream_id: u32,
        core: Arc<TransportCore>,
        events: mpsc::Receiver<CallEvent>,
    ) -> Self {
        Self {
            sender: CallSender::new(stream_id, core),
            events,
            half_closed: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.sender.stream_id
    }

    /// Send one message, chunked if negotiated.
    pub async fn send_message(&mut self, payload: Bytes) -> Result<()> {
        if self.half_closed {
            return Err(ChaoticGoodError::StreamClosed(self.stream_id()));
        }
        self.sender.send_message(payload).await
    }

    /// Half-close: no more messages from this side.
    pub async fn finish_sending(&mut self) -> Result<()> {
        if self.half_closed {
            return Ok(());
        }
        self.sender.ensure_open()?;
        self.half_closed = true;
        self.sender
            .core
            .streams
            .with_stream(self.stream_id(), |s| s.state = StreamState::Closing);
        self.sender
            .send_frame(Frame::ClientEndOfStream {
                stream_id: self.stream_id(),
            })
            .await
    }

    /// Next event from the server; `None` once the call is over.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    /// Cancel the call. The server sees a Cancel frame.
    pub fn cancel(self) {
        self.sender.cancel();
    }
}

impl std::fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("stream_id", &self.stream_id())
            .field("half_closed", &self.half_closed)
            .finish()
    }
}

/// Server end of a call, handed to the stream handler.
pub struct ServerCall {
    sender: CallSender,
    initial_metadata: Metadata,
    events: mpsc::Receiver<CallEvent>,
}

impl ServerCall {
    pub(crate) fn new(
        stream_id: u32,
        core: Arc<TransportCore>,
        initial_metadata: Metadata,
        events: mpsc::Receiver<CallEvent>,
    ) -> Self {
        Self {
            sender: CallSender::new(stream_id, core),
            initial_metadata,
            events,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.sender.stream_id
    }

    /// Metadata the client opened the call with.
    pub fn initial_metadata(&self) -> &Metadata {
        &self.initial_metadata
    }

    pub async fn send_initial_metadata(&mut self, metadata: Metadata) -> Result<()> {
        self.sender.ensure_open()?;
        self.sender
            .send_frame(Frame::ServerInitialMetadata {
                stream_id: self.stream_id(),
                metadata,
            })
            .await
    }

    pub async fn send_message(&mut self, payload: Bytes) -> Result<()> {
        self.sender.send_message(payload).await
    }

    /// Complete the call with trailing metadata.
    pub async fn finish(self, trailing: Metadata) -> Result<()> {
        let stream_id = self.stream_id();
        self.sender.ensure_open()?;
        let result = self
            .sender
            .send_frame(Frame::ServerTrailingMetadata {
                stream_id,
                metadata: trailing,
            })
            .await;
        // Trailers are queued; the stream is done either way.
        self.sender.core.streams.remove(stream_id);
        tracing::debug!("Stream {} finished", stream_id);
        result
    }

    /// Next event from the client; `None` once the call is over.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    pub fn cancel(self) {
        self.sender.cancel();
    }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("stream_id", &self.stream_id())
            .field("initial_metadata", &self.initial_metadata)
            .finish()
    }
}
