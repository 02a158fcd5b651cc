//! The control connection.
//!
//! Every frame header travels here, in order. The endpoint splits into a
//! [`ControlReader`] owned by the read loop and a [`ControlWriter`] owned by
//! the write loop; before the split it can exchange whole frames directly,
//! which the settings handshake uses.

use bytes::Bytes;

use super::io::{Endpoint, EndpointReader, EndpointWriter};
use crate::config::DEFAULT_MAX_FRAME_PAYLOAD;
use crate::error::{ChaoticGoodError, DecodeError, Result};
use crate::protocol::{FrameHeader, HEADER_SIZE};

pub struct ControlEndpoint {
    reader: ControlReader,
    writer: ControlWriter,
}

impl ControlEndpoint {
    pub fn new(endpoint: Endpoint) -> Self {
        let (reader, writer) = endpoint.into_split();
        Self {
            reader: ControlReader {
                inner: reader,
                max_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            },
            writer: ControlWriter { inner: writer },
        }
    }

    /// Largest payload length a header may announce.
    pub fn set_max_payload(&mut self, max: u32) {
        self.reader.max_payload = max;
    }

    pub fn peer_address(&self) -> &str {
        self.reader.inner.peer_address()
    }

    pub async fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(header, payload).await
    }

    /// Read one frame whose payload is inline on this connection.
    pub async fn read_frame(&mut self) -> Result<(FrameHeader, Bytes)> {
        let header = self.reader.read_header().await?;
        if let Some(index) = header.data_connection() {
            return Err(ChaoticGoodError::Protocol(format!(
                "{} payload expected inline, found on data connection {}",
                header.frame_type, index
            )));
        }
        let payload = self.reader.read_payload(header.payload_length as usize).await?;
        Ok((header, payload))
    }

    pub fn into_split(self) -> (ControlReader, ControlWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of the control connection.
pub struct ControlReader {
    inner: EndpointReader,
    max_payload: u32,
}

impl ControlReader {
    /// Read and validate the next header, including its payload length.
    pub async fn read_header(&mut self) -> Result<FrameHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.inner.read_into(&mut buf).await?;
        let header = FrameHeader::parse(&buf)?;
        if header.payload_length > self.max_payload {
            return Err(DecodeError::PayloadTooLarge {
                length: header.payload_length,
                max: self.max_payload,
            }
            .into());
        }
        Ok(header)
    }

    pub async fn read_payload(&mut self, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.inner.read_exact(len).await
    }
}

/// Write half of the control connection.
pub struct ControlWriter {
    inner: EndpointWriter,
}

impl ControlWriter {
    /// Header and payload go out in one vectored write.
    pub async fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let header = header.serialize();
        self.inner.write_vectored(&[&header[..], payload]).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await
    }
}
