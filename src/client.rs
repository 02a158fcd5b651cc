//! Client transport.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the transport.
//! [`ClientTransport::connect`] then:
//! 1. Exchanges Settings on the control connection
//! 2. Brings up the data connections
//! 3. Spawns the write loop and the client read loop
//!
//! # Example
//!
//! ```ignore
//! use chaotic_good::{ClientTransport, Endpoint, Metadata};
//!
//! let control = Endpoint::connect_tcp("127.0.0.1:7000").await?;
//! let client = ClientTransport::builder()
//!     .max_send_chunk_size(64 * 1024)
//!     .connect(control, Vec::new())
//!     .await?;
//!
//! let mut call = client.start_call(Metadata::new().with("path", "/echo")).await?;
//! call.send_message("hello".into()).await?;
//! call.finish_sending().await?;
//! while let Some(event) = call.next_event().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::call::ClientCall;
use crate::config::TransportConfig;
use crate::endpoint::{Endpoint, PendingConnection};
use crate::error::{ChaoticGoodError, Result, Status};
use crate::multiplex::{
    handshake, read_loop, ConnectivityState, Side, TransportCore, EVENT_BUFFER_FULL,
};
use crate::protocol::{Frame, Metadata};
use crate::stream::{CallSink, RegistryError};

/// Builder for a [`ClientTransport`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: TransportConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Alignment the server should pad offloaded payloads to.
    ///
    /// Default: 64
    pub fn alignment(mut self, alignment: u32) -> Self {
        self.config.alignment = alignment;
        self
    }

    /// Largest chunk this side sends.
    ///
    /// Default: 1 MiB
    pub fn max_send_chunk_size(mut self, size: u32) -> Self {
        self.config.max_send_chunk_size = size;
        self
    }

    /// Largest chunk this side accepts.
    ///
    /// Default: 1 MiB
    pub fn max_recv_chunk_size(mut self, size: u32) -> Self {
        self.config.max_recv_chunk_size = size;
        self
    }

    pub fn supports_chunking(mut self, enabled: bool) -> Self {
        self.config.supports_chunking = enabled;
        self
    }

    /// Payloads below this many bytes never leave the control connection.
    ///
    /// Default: 8 KiB
    pub fn inline_payload_threshold(mut self, bytes: usize) -> Self {
        self.config.inline_payload_threshold = bytes;
        self
    }

    /// Bytes buffered per data connection before writers suspend.
    ///
    /// Default: 1 MiB
    pub fn data_connection_buffer(mut self, bytes: usize) -> Self {
        self.config.data_connection_buffer = bytes;
        self
    }

    /// Frames buffered in the outbound queue before senders suspend.
    ///
    /// Default: 256
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.outbound_queue_capacity = capacity;
        self
    }

    /// Unread events a call may hold before it is failed.
    ///
    /// Default: 1024
    pub fn call_event_buffer(mut self, events: usize) -> Self {
        self.config.call_event_buffer = events;
        self
    }

    /// Largest payload a received frame header may announce.
    ///
    /// Default: 64 MiB
    pub fn max_frame_payload(mut self, bytes: u32) -> Self {
        self.config.max_frame_payload = bytes;
        self
    }

    pub async fn connect(
        self,
        control: Endpoint,
        data: Vec<PendingConnection>,
    ) -> Result<ClientTransport> {
        ClientTransport::connect(control, data, self.config).await
    }
}

/// Client end of a chaotic-good transport.
pub struct ClientTransport {
    core: Arc<TransportCore>,
    /// Next stream id. Allocation and the opening frame happen under this
    /// lock so stream ids reach the wire in increasing order.
    next_stream_id: Mutex<u32>,
}

impl ClientTransport {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub async fn connect(
        control: Endpoint,
        data: Vec<PendingConnection>,
        config: TransportConfig,
    ) -> Result<Self> {
        let transport = handshake(Side::Client, control, data, &config).await?;
        let (core, reader) = TransportCore::start(transport);
        tokio::spawn(read_loop(core.clone(), reader, dispatch));

        Ok(Self {
            core,
            next_stream_id: Mutex::new(1),
        })
    }

    /// Open a new call with `metadata`.
    pub async fn start_call(&self, metadata: Metadata) -> Result<ClientCall> {
        let mut next_stream_id = self.next_stream_id.lock().await;
        let stream_id = *next_stream_id;

        let (sink, events) = CallSink::new(self.core.config.call_event_buffer);
        self.core
            .streams
            .insert(stream_id, sink)
            .map_err(|e| match e {
                RegistryError::Closed => ChaoticGoodError::TransportShutdown,
                e => ChaoticGoodError::Protocol(e.to_string()),
            })?;
        *next_stream_id = stream_id
            .checked_add(1)
            .ok_or_else(|| ChaoticGoodError::Protocol("stream ids exhausted".to_string()))?;

        let call = ClientCall::new(stream_id, self.core.clone(), events);
        self.core
            .outbound
            .send(Frame::ClientInitialMetadata {
                stream_id,
                metadata,
            })
            .await?;
        tracing::debug!("Started stream {}", stream_id);
        Ok(call)
    }

    /// Tear the transport down; every call is cancelled with `status`.
    pub fn abort_with_error(&self, status: Status) {
        self.core.abort(status);
    }

    /// Watch connectivity transitions.
    pub fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.core.connectivity()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    /// Number of calls currently registered.
    pub fn active_streams(&self) -> usize {
        self.core.streams.len()
    }

    /// Frames waiting in the outbound queue.
    pub fn pending_frames(&self) -> usize {
        self.core.outbound.pending_count()
    }

    /// Wait until the transport shuts down.
    pub async fn wait_for_shutdown(&self) {
        self.core.wait_for_shutdown().await
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.core.abort(Status::unavailable("client transport dropped"));
    }
}

/// Client-side dispatch of everything but message frames' reassembly.
fn dispatch(core: &Arc<TransportCore>, frame: Frame) {
    match frame {
        Frame::ServerInitialMetadata {
            stream_id,
            metadata,
        } => {
            match core
                .streams
                .with_stream(stream_id, |s| s.sink.push_initial_metadata(metadata))
            {
                None => {
                    tracing::debug!("Dropping initial metadata for unknown stream {}", stream_id)
                }
                Some(true) => {}
                Some(false) => {
                    core.fail_stream(stream_id, Status::resource_exhausted(EVENT_BUFFER_FULL))
                }
            }
        }
        Frame::ServerTrailingMetadata {
            stream_id,
            metadata,
        } => {
            let Some(stream) = core.streams.remove(stream_id) else {
                tracing::debug!("Dropping trailing metadata for unknown stream {}", stream_id);
                return;
            };
            if stream.reassembly.in_message_boundary() {
                tracing::debug!("Stream {} finished by server", stream_id);
                stream.sink.push_trailing_metadata(metadata);
            } else {
                let status =
                    Status::internal("trailing metadata while still receiving a chunked message");
                tracing::warn!("Failing stream {}: {}", stream_id, status);
                stream.sink.cancel(status);
                core.send_cancel(stream_id);
            }
        }
        Frame::Message { stream_id, payload } => core.on_message(stream_id, payload),
        Frame::BeginMessage { stream_id, length } => core.on_begin_message(stream_id, length),
        Frame::MessageChunk { stream_id, payload } => core.on_message_chunk(stream_id, payload),
        Frame::Cancel { stream_id } => core.on_cancel(stream_id),
        other => tracing::warn!("Ignoring unexpected {} on client", other),
    }
}
