//! Frame transport over one control connection and N data connections.
//!
//! Headers always travel on control. A payload travels inline right after
//! its header unless it is at least `inline_payload_threshold` bytes and a
//! data connection is usable; then it is padded to the peer's alignment,
//! queued on a data connection, and the header names that connection.
//!
//! ```text
//! control: [hdr A | payload A] [hdr B (conn 1)] [hdr C | payload C] ...
//! data 0:  ...
//! data 1:  [payload B | pad] ...
//! ```

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::config::NegotiatedConfig;
use crate::endpoint::{ControlEndpoint, ControlReader, ControlWriter, DataEndpoints, ReadTicket};
use crate::error::{ChaoticGoodError, Result};
use crate::protocol::{padding_for, Frame, FrameHeader};

pub struct ChaoticGoodTransport {
    control: ControlEndpoint,
    data: Arc<DataEndpoints>,
    config: NegotiatedConfig,
}

impl ChaoticGoodTransport {
    pub fn new(
        mut control: ControlEndpoint,
        data: DataEndpoints,
        config: NegotiatedConfig,
    ) -> Self {
        control.set_max_payload(config.max_frame_payload);
        Self {
            control,
            data: Arc::new(data),
            config,
        }
    }

    pub fn config(&self) -> &NegotiatedConfig {
        &self.config
    }

    /// Separate halves for the read loop and the write loop.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (control_reader, control_writer) = self.control.into_split();
        (
            TransportReader {
                control: control_reader,
                data: self.data.clone(),
                config: self.config,
            },
            TransportWriter {
                control: control_writer,
                data: self.data,
                config: self.config,
            },
        )
    }
}

/// Outbound half.
pub struct TransportWriter {
    control: ControlWriter,
    data: Arc<DataEndpoints>,
    config: NegotiatedConfig,
}

impl TransportWriter {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let (header, payload) = frame.encode()?;

        if payload.is_empty()
            || payload.len() < self.config.inline_payload_threshold
            || self.data.is_empty()
        {
            tracing::trace!("Writing {} inline", frame);
            return self.control.write_frame(&header, &payload).await;
        }

        let padded = pad(payload, self.config.encode_alignment);
        let index = self.data.write(padded).await?;
        let header = header
            .with_data_connection(index)
            .ok_or(ChaoticGoodError::UnknownDataConnection(index))?;
        tracing::trace!("Writing {} via data connection {}", frame, index);
        self.control.write_frame(&header, &[]).await
    }

    /// Resolves once a data connection has failed.
    pub fn data_failure(&self) -> impl std::future::Future<Output = ChaoticGoodError> + Send + 'static {
        let data = self.data.clone();
        async move { data.failure().await }
    }

    /// Close the control connection's write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.control.shutdown().await
    }
}

/// Append zeros up to the next multiple of `alignment`.
fn pad(payload: Bytes, alignment: u32) -> Bytes {
    let padding = padding_for(payload.len(), alignment as usize);
    if padding == 0 {
        return payload;
    }
    let mut padded = BytesMut::with_capacity(payload.len() + padding);
    padded.extend_from_slice(&payload);
    padded.resize(payload.len() + padding, 0);
    padded.freeze()
}

/// Inbound half.
pub struct TransportReader {
    control: ControlReader,
    data: Arc<DataEndpoints>,
    config: NegotiatedConfig,
}

impl TransportReader {
    /// Read the next header and start fetching its payload.
    ///
    /// An offloaded payload is requested from its data connection right away,
    /// in header order, so reads on that connection stay aligned.
    pub async fn read_frame_bytes(&mut self) -> Result<IncomingFrame> {
        let header = self.control.read_header().await?;

        let payload = match header.data_connection() {
            None => IncomingPayload::Inline(
                self.control
                    .read_payload(header.payload_length as usize)
                    .await?,
            ),
            Some(index) => {
                let len = header.payload_length as usize
                    + header.padding(self.config.decode_alignment) as usize;
                IncomingPayload::Ticket(self.data.read(index, len)?)
            }
        };

        Ok(IncomingFrame { header, payload })
    }
}

enum IncomingPayload {
    Inline(Bytes),
    Ticket(ReadTicket),
}

/// A header whose payload may still be in flight.
pub struct IncomingFrame {
    pub header: FrameHeader,
    payload: IncomingPayload,
}

impl IncomingFrame {
    /// Whether the payload has to come from a data connection.
    pub fn is_offloaded(&self) -> bool {
        matches!(self.payload, IncomingPayload::Ticket(_))
    }

    /// The unpadded payload.
    pub async fn into_payload(self) -> Result<Bytes> {
        match self.payload {
            IncomingPayload::Inline(bytes) => Ok(bytes),
            IncomingPayload::Ticket(ticket) => {
                let mut bytes = ticket.await?;
                bytes.truncate(self.header.payload_length as usize);
                Ok(bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::endpoint::Endpoint;
    use crate::protocol::FrameType;

    fn config(alignment: u32, inline_payload_threshold: usize) -> NegotiatedConfig {
        NegotiatedConfig::symmetric(&TransportConfig {
            alignment,
            inline_payload_threshold,
            ..Default::default()
        })
    }

    /// Two transports wired together with `data` data connections.
    fn connected(data: usize, config: NegotiatedConfig) -> (ChaoticGoodTransport, ChaoticGoodTransport) {
        let (a, b) = Endpoint::pair(64 * 1024);
        let mut a_data = Vec::new();
        let mut b_data = Vec::new();
        for i in 0..data {
            let (x, y) = Endpoint::pair(64 * 1024);
            a_data.push((format!("d{i}"), x));
            b_data.push((format!("d{i}"), y));
        }
        (
            ChaoticGoodTransport::new(
                ControlEndpoint::new(a),
                DataEndpoints::new(a_data, config.data_connection_buffer).unwrap(),
                config,
            ),
            ChaoticGoodTransport::new(
                ControlEndpoint::new(b),
                DataEndpoints::new(b_data, config.data_connection_buffer).unwrap(),
                config,
            ),
        )
    }

    async fn read_frame(reader: &mut TransportReader) -> (FrameHeader, Frame) {
        let incoming = reader.read_frame_bytes().await.unwrap();
        let header = incoming.header;
        let payload = incoming.into_payload().await.unwrap();
        (header, Frame::deserialize(&header, payload).unwrap())
    }

    #[test]
    fn test_pad() {
        let padded = pad(Bytes::from_static(b"abcde"), 8);
        assert_eq!(&padded[..], b"abcde\0\0\0");
        let aligned = Bytes::from_static(b"12345678");
        assert_eq!(pad(aligned.clone(), 8), aligned);
        assert_eq!(pad(Bytes::from_static(b"abc"), 1).len(), 3);
    }

    #[tokio::test]
    async fn test_no_data_connections_stays_inline() {
        let (a, b) = connected(0, config(64, 0));
        let (_a_reader, mut writer) = a.into_split();
        let (mut reader, _b_writer) = b.into_split();

        let frame = Frame::Message {
            stream_id: 1,
            payload: Bytes::from(vec![9u8; 30_000]),
        };
        writer.write_frame(&frame).await.unwrap();

        let incoming = reader.read_frame_bytes().await.unwrap();
        assert!(!incoming.is_offloaded());
        assert_eq!(incoming.header.payload_connection_id, 0);
        let header = incoming.header;
        let payload = incoming.into_payload().await.unwrap();
        assert_eq!(Frame::deserialize(&header, payload).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_small_payload_stays_inline() {
        let (a, b) = connected(2, config(64, 1024));
        let (_a_reader, mut writer) = a.into_split();
        let (mut reader, _b_writer) = b.into_split();

        let frame = Frame::Message {
            stream_id: 3,
            payload: Bytes::from_static(b"tiny"),
        };
        writer.write_frame(&frame).await.unwrap();

        let (header, read) = read_frame(&mut reader).await;
        assert_eq!(header.data_connection(), None);
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_large_payload_offloaded_and_unpadded() {
        let (a, b) = connected(1, config(64, 16));
        let (_a_reader, mut writer) = a.into_split();
        let (mut reader, _b_writer) = b.into_split();

        // 100 bytes on a 64-byte alignment: 28 bytes of padding on the wire.
        let frame = Frame::Message {
            stream_id: 5,
            payload: Bytes::from((0..100u8).collect::<Vec<_>>()),
        };
        writer.write_frame(&frame).await.unwrap();

        let (header, read) = read_frame(&mut reader).await;
        assert_eq!(header.data_connection(), Some(0));
        assert_eq!(header.payload_length, 100);
        assert_eq!(header.padding(64), 28);
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_interleaved_inline_and_offloaded_frames() {
        let (a, b) = connected(2, config(8, 32));
        let (_a_reader, mut writer) = a.into_split();
        let (mut reader, _b_writer) = b.into_split();

        let frames: Vec<Frame> = (1..=6u32)
            .map(|i| Frame::Message {
                stream_id: i,
                payload: Bytes::from(vec![i as u8; if i % 2 == 0 { 10 } else { 77 * i as usize }]),
            })
            .chain(std::iter::once(Frame::Cancel { stream_id: 9 }))
            .collect();
        for frame in &frames {
            writer.write_frame(frame).await.unwrap();
        }

        for expected in &frames {
            let (_, read) = read_frame(&mut reader).await;
            assert_eq!(&read, expected);
        }
    }

    #[tokio::test]
    async fn test_metadata_frames_offload_too() {
        let (a, b) = connected(1, config(4, 1));
        let (_a_reader, mut writer) = a.into_split();
        let (mut reader, _b_writer) = b.into_split();

        let frame = Frame::ClientInitialMetadata {
            stream_id: 1,
            metadata: crate::protocol::Metadata::new().with("path", "/svc/Method"),
        };
        writer.write_frame(&frame).await.unwrap();

        let (header, read) = read_frame(&mut reader).await;
        assert_eq!(header.frame_type, FrameType::ClientInitialMetadata);
        assert!(header.data_connection().is_some());
        assert_eq!(read, frame);
    }
}
