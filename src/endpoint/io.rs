//! Byte-stream endpoints.
//!
//! An [`Endpoint`] is one connected byte stream (TCP socket, in-memory pipe,
//! anything implementing tokio's `AsyncRead`/`AsyncWrite`) plus the peer's
//! address. The transport always splits it so the reading and writing halves
//! can be owned by different tasks.

use std::future::Future;
use std::io::{self, IoSlice};
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ChaoticGoodError, Result};

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected byte stream.
pub struct Endpoint {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer_address: String,
}

impl Endpoint {
    /// Build an endpoint from separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W, peer_address: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_address: peer_address.into(),
        }
    }

    /// Build an endpoint from a single bidirectional stream.
    pub fn from_stream<S>(stream: S, peer_address: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, peer_address)
    }

    /// Wrap a connected TCP stream. Nagle is disabled: frames are written whole.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer_address = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, peer_address))
    }

    /// Connect to `addr` over TCP.
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        Self::from_tcp(TcpStream::connect(addr).await?)
    }

    /// Two in-memory endpoints connected to each other.
    ///
    /// `capacity` bounds the bytes buffered in each direction.
    pub fn pair(capacity: usize) -> (Endpoint, Endpoint) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            Self::from_stream(a, "memory:b"),
            Self::from_stream(b, "memory:a"),
        )
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub fn into_split(self) -> (EndpointReader, EndpointWriter) {
        (
            EndpointReader {
                inner: self.reader,
                peer_address: self.peer_address,
            },
            EndpointWriter { inner: self.writer },
        )
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer_address", &self.peer_address)
            .finish_non_exhaustive()
    }
}

/// Reading half of an [`Endpoint`].
pub struct EndpointReader {
    inner: BoxedReader,
    peer_address: String,
}

impl EndpointReader {
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Read exactly `len` bytes.
    ///
    /// A clean EOF maps to `ConnectionClosed`.
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.read_into(&mut buf).await?;
        Ok(buf.freeze())
    }

    /// Fill `buf` completely.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ChaoticGoodError::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Writing half of an [`Endpoint`].
pub struct EndpointWriter {
    inner: BoxedWriter,
}

impl EndpointWriter {
    /// Write all of `data` and flush.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write every part in order using scatter/gather I/O, then flush.
    ///
    /// Partial writes are resumed from where the kernel stopped.
    pub async fn write_vectored(&mut self, parts: &[&[u8]]) -> Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut written = 0;

        while written < total {
            let slices = remaining_slices(parts, written);
            let n = self.inner.write_vectored(&slices).await?;
            if n == 0 {
                return Err(ChaoticGoodError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_vectored returned 0",
                )));
            }
            written += n;
        }

        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction; the peer observes EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// IoSlices covering `parts` after skipping the first `skip_bytes`.
fn remaining_slices<'a>(parts: &[&'a [u8]], skip_bytes: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(parts.len());
    let mut start = 0;

    for part in parts {
        let end = start + part.len();
        if !part.is_empty() && skip_bytes < end {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&part[offset..]));
        }
        start = end;
    }

    slices
}

/// A data connection that is still being established.
///
/// The id is exchanged in Settings so both sides agree on connection order.
pub struct PendingConnection {
    id: String,
    connect: BoxFuture<'static, Result<Endpoint>>,
}

impl PendingConnection {
    pub fn new<F>(id: impl Into<String>, connect: F) -> Self
    where
        F: Future<Output = Result<Endpoint>> + Send + 'static,
    {
        Self {
            id: id.into(),
            connect: Box::pin(connect),
        }
    }

    /// A connection that is already established.
    pub fn ready(id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self::new(id, async move { Ok(endpoint) })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the connection; yields its id alongside.
    pub async fn resolve(self) -> Result<(String, Endpoint)> {
        let endpoint = self.connect.await?;
        Ok((self.id, endpoint))
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
