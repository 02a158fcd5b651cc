//! State and loops shared by the client and server multiplexers.
//!
//! A [`TransportCore`] owns the stream registry, the outbound queue and the
//! connectivity state of one transport. Two tasks drive it:
//!
//! - the write loop (see [`crate::writer`]) drains the outbound queue;
//! - the read loop reads frames, routes message frames through each stream's
//!   reassembly, and hands everything else to a side-specific dispatcher.
//!
//! Any I/O failure on either loop, or on a data connection, aborts the whole
//! transport: the registry is drained exactly once and every call is
//! cancelled.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::config::{NegotiatedConfig, TransportConfig};
use crate::endpoint::{ControlEndpoint, DataEndpoints, Endpoint, PendingConnection};
use crate::error::{ChaoticGoodError, DecodeError, Result, Status};
use crate::message::{MessageChunker, MessageReassembly, ReassemblyError};
use crate::protocol::{Frame, FrameHeader, FrameType, Settings};
use crate::stream::StreamRegistry;
use crate::transport::{ChaoticGoodTransport, TransportReader};
use crate::writer::{outbound_queue, write_loop, WriterHandle};

/// Reason given when a call falls too far behind its inbound events.
pub(crate) const EVENT_BUFFER_FULL: &str = "call event buffer full";

/// Observable transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Ready,
    /// Terminal.
    Shutdown,
}

/// Which end of the transport this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

pub(crate) struct TransportCore {
    pub(crate) streams: StreamRegistry,
    pub(crate) outbound: WriterHandle,
    pub(crate) chunker: MessageChunker,
    pub(crate) config: NegotiatedConfig,
    state: watch::Sender<ConnectivityState>,
}

impl TransportCore {
    /// Spawn the write loop and return the core with the read half.
    pub(crate) fn start(transport: ChaoticGoodTransport) -> (Arc<Self>, TransportReader) {
        let config = *transport.config();
        let (reader, writer) = transport.into_split();
        let (outbound, rx) = outbound_queue(config.outbound_queue_capacity);
        let (state, state_rx) = watch::channel(ConnectivityState::Ready);

        let core = Arc::new(Self {
            streams: StreamRegistry::new(),
            outbound,
            chunker: MessageChunker::from_config(&config),
            config,
            state,
        });

        let write_core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(rx, writer, state_rx).await {
                tracing::error!("Write loop failed: {}", e);
                write_core.abort(Status::unavailable(format!("write failed: {}", e)));
            }
        });

        (core, reader)
    }

    pub(crate) fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.state.borrow() == ConnectivityState::Shutdown
    }

    pub(crate) async fn wait_for_shutdown(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectivityState::Shutdown)
            .await;
    }

    /// Shut the transport down and cancel every call with `status`.
    ///
    /// Only the first call has any effect; returns whether this was it.
    pub(crate) fn abort(&self, status: Status) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == ConnectivityState::Shutdown {
                false
            } else {
                *state = ConnectivityState::Shutdown;
                true
            }
        });
        if !first {
            return false;
        }

        let streams = self.streams.drain();
        tracing::debug!("Transport aborted ({}), cancelling {} streams", status, streams.len());
        for stream in streams {
            stream.sink.cancel(status.clone());
        }
        true
    }

    fn abort_on_error(&self, error: &ChaoticGoodError) {
        match error {
            ChaoticGoodError::ConnectionClosed => {
                tracing::debug!("Peer closed the control connection");
            }
            e => tracing::error!("Read loop failed: {}", e),
        }
        self.abort(Status::from(error));
    }

    /// Queue a Cancel frame without blocking the caller.
    pub(crate) fn send_cancel(&self, stream_id: u32) {
        match self.outbound.try_send(Frame::Cancel { stream_id }) {
            Ok(()) => {}
            Err(ChaoticGoodError::QueueFull) => {
                // Runs from Drop too, possibly outside the runtime.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send(Frame::Cancel { stream_id }).await;
                    });
                }
            }
            Err(_) => {}
        }
    }

    /// Fail one stream: cancel its call locally and tell the peer.
    pub(crate) fn fail_stream(&self, stream_id: u32, status: Status) {
        match self.streams.remove(stream_id) {
            Some(stream) => {
                tracing::warn!("Failing stream {}: {}", stream_id, status);
                stream.sink.cancel(status);
                self.send_cancel(stream_id);
            }
            None => tracing::debug!("Stream {} already gone ({})", stream_id, status),
        }
    }

    /// Peer sent Cancel.
    pub(crate) fn on_cancel(&self, stream_id: u32) {
        if let Some(stream) = self.streams.remove(stream_id) {
            tracing::debug!("Stream {} cancelled by peer", stream_id);
            stream.sink.cancel(Status::cancelled("cancelled by peer"));
        }
    }

    pub(crate) fn on_message(&self, stream_id: u32, payload: Bytes) {
        self.reassemble(stream_id, |r| r.message(payload).map(Some));
    }

    pub(crate) fn on_begin_message(&self, stream_id: u32, length: u64) {
        self.reassemble(stream_id, |r| r.begin_message(length).map(|()| None));
    }

    /// Chunks above the negotiated receive size fail their stream.
    pub(crate) fn on_message_chunk(&self, stream_id: u32, payload: Bytes) {
        let limit = self.config.max_recv_chunk_size;
        if payload.len() > limit as usize {
            let reason = if limit == 0 {
                "message chunk received but chunking was not negotiated".to_string()
            } else {
                format!(
                    "message chunk of {} bytes exceeds the limit of {}",
                    payload.len(),
                    limit
                )
            };
            self.fail_stream(stream_id, Status::internal(reason));
            return;
        }
        self.reassemble(stream_id, |r| r.message_chunk(payload));
    }

    fn reassemble<F>(&self, stream_id: u32, step: F)
    where
        F: FnOnce(&mut MessageReassembly) -> std::result::Result<Option<Bytes>, ReassemblyError>,
    {
        let outcome = self.streams.with_stream(stream_id, |stream| {
            match step(&mut stream.reassembly) {
                Ok(Some(message)) if !stream.sink.push_message(message.clone()) => {
                    Err(Status::resource_exhausted(EVENT_BUFFER_FULL))
                }
                Ok(_) => Ok(()),
                Err(e) => Err(Status::internal(e.to_string())),
            }
        });

        match outcome {
            None => tracing::debug!("Dropping message frame for unknown stream {}", stream_id),
            Some(Ok(())) => {}
            Some(Err(status)) => self.fail_stream(stream_id, status),
        }
    }
}

/// Exchange Settings on a fresh control connection.
///
/// Both sides send first, then read; the first frame received must be
/// Settings.
pub(crate) async fn exchange_settings(
    control: &mut ControlEndpoint,
    local: &Settings,
) -> Result<Settings> {
    let (header, payload) = Frame::Settings(local.clone()).encode()?;
    control.write_frame(&header, &payload).await?;

    let (header, payload) = control.read_frame().await?;
    match Frame::deserialize(&header, payload)? {
        Frame::Settings(settings) => Ok(settings),
        other => Err(ChaoticGoodError::Protocol(format!(
            "expected Settings as the first control frame, got {}",
            other
        ))),
    }
}

/// Run the settings handshake and bring up the data connections.
///
/// The client announces its data connections in pending order; the server
/// reorders its own to match.
pub(crate) async fn handshake(
    side: Side,
    control: Endpoint,
    pending: Vec<PendingConnection>,
    config: &TransportConfig,
) -> Result<ChaoticGoodTransport> {
    let mut control = ControlEndpoint::new(control);
    control.set_max_payload(config.max_frame_payload.max(1));
    let ids = pending.iter().map(|p| p.id().to_string()).collect();

    let peer = exchange_settings(&mut control, &config.local_settings(ids)).await?;
    let order = match side {
        Side::Client => Vec::new(),
        Side::Server => peer.data_connection_ids.clone(),
    };
    let data = DataEndpoints::connect(pending, &order, config.data_connection_buffer).await?;
    let negotiated = config.negotiate(&peer);

    tracing::debug!(
        "{:?} transport to {} ready: {} data connections, {:?}",
        side,
        control.peer_address(),
        data.len(),
        negotiated
    );
    Ok(ChaoticGoodTransport::new(control, data, negotiated))
}

/// Read frames until shutdown or a transport-fatal error.
///
/// Decode failures on a stream only fail that stream. Unknown frame types and
/// late Settings are skipped.
pub(crate) async fn read_loop<F>(core: Arc<TransportCore>, mut reader: TransportReader, mut dispatch: F)
where
    F: FnMut(&Arc<TransportCore>, Frame),
{
    tracing::debug!("Read loop started");
    let mut state = core.connectivity();

    loop {
        let next = async {
            let incoming = reader.read_frame_bytes().await?;
            let header = incoming.header;
            let payload = incoming.into_payload().await?;
            Ok::<_, ChaoticGoodError>((header, payload))
        };

        let (header, payload) = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == ConnectivityState::Shutdown) => break,
            result = next => match result {
                Ok(frame) => frame,
                Err(e) => {
                    core.abort_on_error(&e);
                    break;
                }
            },
        };

        match Frame::deserialize(&header, payload) {
            Ok(Frame::Settings(_)) => {
                tracing::warn!("Ignoring Settings frame received after the handshake");
            }
            Ok(frame) => {
                tracing::trace!("Received {}", frame);
                dispatch(&core, frame);
            }
            Err(DecodeError::UnknownFrameType(byte)) => {
                tracing::warn!(
                    "Ignoring frame of unknown type {:#04x} on stream {}",
                    byte,
                    header.stream_id
                );
            }
            Err(e) if is_fatal(&header, &e) => {
                tracing::error!("Undecodable {}: {}", header, e);
                core.abort(Status::unavailable(format!(
                    "undecodable {} frame: {}",
                    header.frame_type, e
                )));
                break;
            }
            Err(e) => core.fail_stream(
                header.stream_id,
                Status::internal(format!("failed to decode {}: {}", header.frame_type, e)),
            ),
        }
    }

    tracing::debug!("Read loop stopped");
}

/// Errors that cannot be pinned on a single stream.
fn is_fatal(header: &FrameHeader, error: &DecodeError) -> bool {
    header.frame_type == FrameType::Settings
        || matches!(error, DecodeError::IllegalStreamId { .. })
}
