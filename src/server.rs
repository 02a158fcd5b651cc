//! Server transport.
//!
//! Each stream the client opens is handed to a [`StreamHandler`] running on
//! its own task. At most `max_concurrent_streams` handlers run at once;
//! streams beyond that are refused with a Cancel frame.
//!
//! # Example
//!
//! ```ignore
//! use chaotic_good::{CallEvent, Metadata, ServerCall, ServerTransport};
//!
//! let server = ServerTransport::builder()
//!     .max_concurrent_streams(64)
//!     .serve(control, data, |mut call: ServerCall| async move {
//!         while let Some(CallEvent::Message(m)) = call.next_event().await {
//!             let _ = call.send_message(m).await;
//!         }
//!         let _ = call.finish(Metadata::new()).await;
//!     })
//!     .await?;
//! server.wait_for_shutdown().await;
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::call::ServerCall;
use crate::config::TransportConfig;
use crate::endpoint::{BoxFuture, Endpoint, PendingConnection};
use crate::error::{Result, Status};
use crate::multiplex::{
    handshake, read_loop, ConnectivityState, Side, TransportCore, EVENT_BUFFER_FULL,
};
use crate::protocol::{Frame, Metadata};
use crate::stream::{CallSink, RegistryError, StreamState};

/// Accepts new streams.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle(&self, call: ServerCall) -> BoxFuture<'static, ()>;
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, call: ServerCall) -> BoxFuture<'static, ()> {
        Box::pin(self(call))
    }
}

/// Builder for a [`ServerTransport`].
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: TransportConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of concurrently running stream handlers.
    ///
    /// Default: 256
    pub fn max_concurrent_streams(mut self, limit: usize) -> Self {
        self.config.max_concurrent_streams = limit;
        self
    }

    pub fn alignment(mut self, alignment: u32) -> Self {
        self.config.alignment = alignment;
        self
    }

    pub fn max_send_chunk_size(mut self, size: u32) -> Self {
        self.config.max_send_chunk_size = size;
        self
    }

    pub fn max_recv_chunk_size(mut self, size: u32) -> Self {
        self.config.max_recv_chunk_size = size;
        self
    }

    pub fn supports_chunking(mut self, enabled: bool) -> Self {
        self.config.supports_chunking = enabled;
        self
    }

    pub fn inline_payload_threshold(mut self, bytes: usize) -> Self {
        self.config.inline_payload_threshold = bytes;
        self
    }

    pub fn call_event_buffer(mut self, events: usize) -> Self {
        self.config.call_event_buffer = events;
        self
    }

    pub fn max_frame_payload(mut self, bytes: u32) -> Self {
        self.config.max_frame_payload = bytes;
        self
    }

    pub async fn serve<H>(
        self,
        control: Endpoint,
        data: Vec<PendingConnection>,
        handler: H,
    ) -> Result<ServerTransport>
    where
        H: StreamHandler,
    {
        ServerTransport::serve(control, data, self.config, handler).await
    }
}

/// Server end of a chaotic-good transport.
pub struct ServerTransport {
    core: Arc<TransportCore>,
}

impl ServerTransport {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub async fn serve<H>(
        control: Endpoint,
        data: Vec<PendingConnection>,
        config: TransportConfig,
        handler: H,
    ) -> Result<Self>
    where
        H: StreamHandler,
    {
        let transport = handshake(Side::Server, control, data, &config).await?;
        let (core, reader) = TransportCore::start(transport);

        let acceptor = Acceptor {
            handler: Arc::new(handler),
            permits: Arc::new(Semaphore::new(core.config.max_concurrent_streams)),
        };
        tokio::spawn(read_loop(core.clone(), reader, move |core, frame| {
            acceptor.dispatch(core, frame)
        }));

        Ok(Self { core })
    }

    /// Tear the transport down; every call is cancelled with `status`.
    pub fn abort_with_error(&self, status: Status) {
        self.core.abort(status);
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.core.connectivity()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    pub fn active_streams(&self) -> usize {
        self.core.streams.len()
    }

    pub async fn wait_for_shutdown(&self) {
        self.core.wait_for_shutdown().await
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.core.abort(Status::unavailable("server transport dropped"));
    }
}

struct Acceptor<H> {
    handler: Arc<H>,
    permits: Arc<Semaphore>,
}

impl<H: StreamHandler> Acceptor<H> {
    fn dispatch(&self, core: &Arc<TransportCore>, frame: Frame) {
        match frame {
            Frame::ClientInitialMetadata {
                stream_id,
                metadata,
            } => self.accept(core, stream_id, metadata),
            Frame::ClientEndOfStream { stream_id } => end_of_stream(core, stream_id),
            Frame::Message { stream_id, payload } => core.on_message(stream_id, payload),
            Frame::BeginMessage { stream_id, length } => core.on_begin_message(stream_id, length),
            Frame::MessageChunk { stream_id, payload } => {
                core.on_message_chunk(stream_id, payload)
            }
            Frame::Cancel { stream_id } => core.on_cancel(stream_id),
            other => tracing::warn!("Ignoring unexpected {} on server", other),
        }
    }

    fn accept(&self, core: &Arc<TransportCore>, stream_id: u32, metadata: Metadata) {
        let (sink, events) = CallSink::new(core.config.call_event_buffer);
        match core.streams.insert(stream_id, sink) {
            Ok(()) => {}
            Err(RegistryError::Duplicate(_)) => {
                core.fail_stream(
                    stream_id,
                    Status::internal(format!("stream id {} opened twice", stream_id)),
                );
                return;
            }
            Err(RegistryError::Closed) => return,
            Err(e) => {
                tracing::warn!("Refusing stream {}: {}", stream_id, e);
                core.send_cancel(stream_id);
                return;
            }
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("Stream capacity reached, refusing stream {}", stream_id);
                core.fail_stream(
                    stream_id,
                    Status::resource_exhausted("too many concurrent streams"),
                );
                return;
            }
        };

        tracing::debug!("Accepted stream {}", stream_id);
        let call = ServerCall::new(stream_id, core.clone(), metadata, events);
        let handler = self.handler.handle(call);
        tokio::spawn(async move {
            // Permit is held until the handler completes.
            let _permit = permit;
            handler.await;
        });
    }
}

fn end_of_stream(core: &Arc<TransportCore>, stream_id: u32) {
    let outcome = core.streams.with_stream(stream_id, |stream| {
        if !stream.reassembly.in_message_boundary() {
            return Err(Status::internal(
                "end of stream while still receiving a chunked message",
            ));
        }
        if stream.state == StreamState::Closing {
            return Err(Status::internal("end of stream received twice"));
        }
        stream.state = StreamState::Closing;
        if !stream.sink.push_end_of_stream() {
            return Err(Status::resource_exhausted(EVENT_BUFFER_FULL));
        }
        Ok(())
    });

    match outcome {
        None => tracing::debug!("Dropping end of stream for unknown stream {}", stream_id),
        Some(Ok(())) => {}
        Some(Err(status)) => core.fail_stream(stream_id, status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = ServerTransport::builder()
            .max_concurrent_streams(4)
            .alignment(8)
            .max_send_chunk_size(1024)
            .max_recv_chunk_size(2048)
            .supports_chunking(true)
            .inline_payload_threshold(64)
            .call_event_buffer(4)
            .max_frame_payload(4096);

        assert_eq!(builder.config.max_concurrent_streams, 4);
        assert_eq!(builder.config.alignment, 8);
        assert_eq!(builder.config.max_send_chunk_size, 1024);
        assert_eq!(builder.config.max_recv_chunk_size, 2048);
        assert_eq!(builder.config.inline_payload_threshold, 64);
        assert_eq!(builder.config.call_event_buffer, 4);
        assert_eq!(builder.config.max_frame_payload, 4096);
    }

    #[test]
    fn test_closures_are_handlers() {
        fn assert_handler<H: StreamHandler>(_: &H) {}
        let handler = |call: ServerCall| async move {
            let _ = call.finish(Metadata::new()).await;
        };
        assert_handler(&handler);
    }
}
