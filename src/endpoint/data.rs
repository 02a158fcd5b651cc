//! Fan-out over the data connections.
//!
//! # Architecture
//!
//! ```text
//!               ┌─► budget ─► write queue ─► writer task ─► connection 0
//! write(bytes) ─┤
//!               └─► budget ─► write queue ─► writer task ─► connection 1
//!
//! read(i, len) ─► read backlog i ─► reader task i ─► ReadTicket resolves
//! ```
//!
//! Each physical connection has its own writer task and reader task, so a
//! slow connection only delays the payloads routed to it. Reads on one
//! connection are served strictly in request order; that order matches the
//! order of the headers on the control connection, which is what keeps both
//! sides aligned.
//!
//! A connection that fails is never used again, and the failure is reported
//! once through [`DataEndpoints::failure`] so the transport can shut down.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use super::io::{Endpoint, EndpointReader, EndpointWriter, PendingConnection};
use crate::backpressure::{BackpressureController, BackpressureGuard};
use crate::error::{ChaoticGoodError, Result};

/// Maximum queued payloads written in one vectored call.
const MAX_BATCH_SIZE: usize = 64;

/// Largest pool whose indices all fit the header's connection id.
pub const MAX_DATA_CONNECTIONS: usize = u16::MAX as usize - 1;

struct WriteRequest {
    payload: Bytes,
    // Budget is released once the payload has been written.
    _guard: BackpressureGuard,
}

struct ReadRequest {
    len: usize,
    reply: oneshot::Sender<Result<Bytes>>,
}

struct Connection {
    id: String,
    budget: BackpressureController,
    writes: mpsc::UnboundedSender<WriteRequest>,
    reads: mpsc::UnboundedSender<ReadRequest>,
    usable: Arc<AtomicBool>,
    tasks: [AbortHandle; 2],
}

impl Connection {
    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }
}

/// The set of data connections of one transport.
pub struct DataEndpoints {
    connections: Vec<Connection>,
    next: AtomicUsize,
    // Index of the first connection that failed.
    failed: Arc<watch::Sender<Option<usize>>>,
}

impl DataEndpoints {
    /// No data connections; every payload stays on control.
    pub fn empty() -> Self {
        Self {
            connections: Vec::new(),
            next: AtomicUsize::new(0),
            failed: Arc::new(watch::channel(None).0),
        }
    }

    /// Spawn the per-connection tasks for already-established endpoints.
    ///
    /// `buffer` is the per-connection write budget in bytes. Must be called
    /// from within a tokio runtime. Fails for more than
    /// [`MAX_DATA_CONNECTIONS`] endpoints.
    pub fn new(endpoints: Vec<(String, Endpoint)>, buffer: usize) -> Result<Self> {
        if endpoints.len() > MAX_DATA_CONNECTIONS {
            return Err(ChaoticGoodError::Protocol(format!(
                "{} data connections exceed the limit of {}",
                endpoints.len(),
                MAX_DATA_CONNECTIONS
            )));
        }

        let failed = Arc::new(watch::channel(None).0);
        let connections = endpoints
            .into_iter()
            .enumerate()
            .map(|(index, (id, endpoint))| {
                spawn_connection(index, id, endpoint, buffer, failed.clone())
            })
            .collect();
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            failed,
        })
    }

    /// Resolve `pending` and order the connections by `order`.
    ///
    /// An empty `order` keeps the pending order. Otherwise every id in
    /// `order` must name exactly one pending connection.
    pub async fn connect(
        pending: Vec<PendingConnection>,
        order: &[String],
        buffer: usize,
    ) -> Result<Self> {
        let mut resolved = Vec::with_capacity(pending.len());
        for connection in pending {
            resolved.push(connection.resolve().await?);
        }

        if !order.is_empty() {
            if order.len() != resolved.len() {
                return Err(ChaoticGoodError::Protocol(format!(
                    "peer announced {} data connections, {} are available",
                    order.len(),
                    resolved.len()
                )));
            }
            let mut ordered = Vec::with_capacity(resolved.len());
            for id in order {
                let position = resolved
                    .iter()
                    .position(|(candidate, _)| candidate == id)
                    .ok_or_else(|| {
                        ChaoticGoodError::Protocol(format!("unknown data connection id {:?}", id))
                    })?;
                ordered.push(resolved.swap_remove(position));
            }
            resolved = ordered;
        }

        tracing::debug!("Data connections ready: {}", resolved.len());
        Self::new(resolved, buffer)
    }

    /// Number of connections, usable or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no connection can carry payloads.
    pub fn is_empty(&self) -> bool {
        !self.connections.iter().any(Connection::is_usable)
    }

    /// Connection ids in index order.
    pub fn ids(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.id.clone()).collect()
    }

    /// Queue `payload` on the least-loaded connection and return its index.
    ///
    /// Suspends while that connection's budget is exhausted. Returns once the
    /// payload is in the connection's ordered queue.
    pub async fn write(&self, payload: Bytes) -> Result<usize> {
        let index = self.pick_connection()?;
        let connection = &self.connections[index];

        let guard = connection.budget.reserve(payload.len()).await?;
        connection
            .writes
            .send(WriteRequest {
                payload,
                _guard: guard,
            })
            .map_err(|_| connection_failed(index))?;
        Ok(index)
    }

    /// Request `len` bytes from connection `index`.
    ///
    /// The ticket resolves once every earlier read on that connection has
    /// been served and `len` bytes have arrived.
    pub fn read(&self, index: usize, len: usize) -> Result<ReadTicket> {
        let connection = self
            .connections
            .get(index)
            .ok_or(ChaoticGoodError::UnknownDataConnection(index))?;
        if !connection.is_usable() {
            return Err(connection_failed(index));
        }

        let (reply, rx) = oneshot::channel();
        connection
            .reads
            .send(ReadRequest { len, reply })
            .map_err(|_| connection_failed(index))?;
        Ok(ReadTicket { rx })
    }

    /// Resolves with an I/O error once any connection has failed.
    ///
    /// Never resolves for a pool without connections.
    pub async fn failure(&self) -> ChaoticGoodError {
        let mut rx = self.failed.subscribe();
        let index = match rx.wait_for(Option::is_some).await {
            Ok(failed) => *failed,
            Err(_) => None,
        };
        match index {
            Some(index) => connection_failed(index),
            None => std::future::pending().await,
        }
    }

    /// Most free budget wins; ties go to whichever comes first after a
    /// rotating start point.
    fn pick_connection(&self) -> Result<usize> {
        let count = self.connections.len();
        if count == 0 {
            return Err(ChaoticGoodError::ConnectionClosed);
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;

        let mut best: Option<(usize, usize)> = None;
        for offset in 0..count {
            let index = (start + offset) % count;
            let connection = &self.connections[index];
            if !connection.is_usable() {
                continue;
            }
            let free = connection.budget.available();
            if best.map_or(true, |(_, best_free)| free > best_free) {
                best = Some((index, free));
            }
        }

        best
            .map(|(index, _)| index)
            .ok_or(ChaoticGoodError::ConnectionClosed)
    }
}

impl Drop for DataEndpoints {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.budget.close();
            for task in &connection.tasks {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for DataEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEndpoints")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Pending data-connection read.
///
/// Dropping the ticket only drops interest: the bytes are still consumed from
/// the connection and discarded.
#[must_use = "tickets do nothing unless awaited"]
pub struct ReadTicket {
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl Future for ReadTicket {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChaoticGoodError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn connection_failed(index: usize) -> ChaoticGoodError {
    ChaoticGoodError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("data connection {} failed", index),
    ))
}

fn report_failure(failed: &watch::Sender<Option<usize>>, index: usize) {
    failed.send_if_modified(|first| {
        if first.is_some() {
            return false;
        }
        *first = Some(index);
        true
    });
}

fn spawn_connection(
    index: usize,
    id: String,
    endpoint: Endpoint,
    buffer: usize,
    failed: Arc<watch::Sender<Option<usize>>>,
) -> Connection {
    let (reader, writer) = endpoint.into_split();
    let (writes, write_rx) = mpsc::unbounded_channel();
    let (reads, read_rx) = mpsc::unbounded_channel();
    let budget = BackpressureController::new(buffer);
    let usable = Arc::new(AtomicBool::new(true));

    let write_task = tokio::spawn(writer_task(
        index,
        writer,
        write_rx,
        budget.clone(),
        usable.clone(),
        failed.clone(),
    ));
    let read_task = tokio::spawn(reader_task(index, reader, read_rx, usable.clone(), failed));

    Connection {
        id,
        budget,
        writes,
        reads,
        usable,
        tasks: [write_task.abort_handle(), read_task.abort_handle()],
    }
}

/// Drain the write queue, batching whatever is ready into one vectored write.
async fn writer_task(
    index: usize,
    mut writer: EndpointWriter,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
    budget: BackpressureController,
    usable: Arc<AtomicBool>,
    failed: Arc<watch::Sender<Option<usize>>>,
) {
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = queue.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match queue.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        let parts: Vec<&[u8]> = batch.iter().map(|r| &r.payload[..]).collect();
        let result = writer.write_vectored(&parts).await;
        drop(parts);

        if let Err(e) = result {
            tracing::warn!("Data connection {} write failed: {}", index, e);
            usable.store(false, Ordering::Release);
            budget.close();
            report_failure(&failed, index);
            return;
        }
        batch.clear();
    }
}

/// Serve read requests in order; bytes for dropped tickets are discarded.
async fn reader_task(
    index: usize,
    mut reader: EndpointReader,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    usable: Arc<AtomicBool>,
    failed: Arc<watch::Sender<Option<usize>>>,
) {
    while let Some(request) = requests.recv().await {
        match reader.read_exact(request.len).await {
            Ok(bytes) => {
                if request.reply.send(Ok(bytes)).is_err() {
                    tracing::trace!(
                        "Data connection {}: discarded {} bytes of a dropped read",
                        index,
                        request.len
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Data connection {} read failed: {}", index, e);
                usable.store(false, Ordering::Release);
                report_failure(&failed, index);
                let _ = request.reply.send(Err(e));
                requests.close();
                while let Some(request) = requests.recv().await {
                    let _ = request.reply.send(Err(connection_failed(index)));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// `count` connections; returns both ends of each.
    fn pools(count: usize, buffer: usize) -> (DataEndpoints, DataEndpoints) {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for i in 0..count {
            let (a, b) = Endpoint::pair(64 * 1024);
            local.push((format!("data-{i}"), a));
            remote.push((format!("data-{i}"), b));
        }
        (
            DataEndpoints::new(local, buffer).unwrap(),
            DataEndpoints::new(remote, buffer).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = DataEndpoints::empty();
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
        assert!(matches!(
            pool.write(Bytes::from_static(b"x")).await,
            Err(ChaoticGoodError::ConnectionClosed)
        ));
        assert!(matches!(
            pool.read(0, 1),
            Err(ChaoticGoodError::UnknownDataConnection(0))
        ));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (local, remote) = pools(1, 1024);
        assert!(!local.is_empty());

        let index = local.write(Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(index, 0);

        let bytes = remote.read(index, 7).unwrap().await.unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn test_reads_resolve_in_fifo_order() {
        let (local, remote) = pools(1, 1024);

        let first = remote.read(0, 3).unwrap();
        let second = remote.read(0, 4).unwrap();

        local.write(Bytes::from_static(b"abc")).await.unwrap();
        local.write(Bytes::from_static(b"defg")).await.unwrap();

        // Awaiting out of order still yields bytes in request order.
        assert_eq!(&second.await.unwrap()[..], b"defg");
        assert_eq!(&first.await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn test_dropped_ticket_keeps_alignment() {
        let (local, remote) = pools(1, 1024);

        let dropped = remote.read(0, 5).unwrap();
        let kept = remote.read(0, 5).unwrap();
        drop(dropped);

        local.write(Bytes::from_static(b"AAAAA")).await.unwrap();
        local.write(Bytes::from_static(b"BBBBB")).await.unwrap();

        assert_eq!(&kept.await.unwrap()[..], b"BBBBB");
    }

    #[tokio::test]
    async fn test_ties_rotate_between_connections() {
        let (local, remote) = pools(2, 1024);

        let mut used = Vec::new();
        for _ in 0..4 {
            let index = local.write(Bytes::from_static(b"z")).await.unwrap();
            used.push(index);
            // Wait for the write to drain so budgets are equal again.
            remote.read(index, 1).unwrap().await.unwrap();
        }
        assert!(used.contains(&0));
        assert!(used.contains(&1));
    }

    #[tokio::test]
    async fn test_least_loaded_connection_preferred() {
        // 8-byte pipes that nobody drains: reserved budget stays reserved.
        let (a0, _b0) = Endpoint::pair(8);
        let (a1, _b1) = Endpoint::pair(8);
        let local = DataEndpoints::new(
            vec![("d0".to_string(), a0), ("d1".to_string(), a1)],
            1024,
        )
        .unwrap();

        assert_eq!(local.write(Bytes::from(vec![0u8; 900])).await.unwrap(), 0);
        assert_eq!(local.write(Bytes::from(vec![0u8; 10])).await.unwrap(), 1);
        // Round-robin would pick 0 next; 0 has far less budget left.
        assert_eq!(local.write(Bytes::from(vec![0u8; 10])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_suspends_until_budget_frees() {
        // Tiny pipe so the writer task blocks and budget stays reserved.
        let (a, b) = Endpoint::pair(8);
        let local = DataEndpoints::new(vec![("d".to_string(), a)], 16).unwrap();
        let remote = DataEndpoints::new(vec![("d".to_string(), b)], 16).unwrap();

        local.write(Bytes::from(vec![1u8; 16])).await.unwrap();

        let local = Arc::new(local);
        let blocked = {
            let local = local.clone();
            tokio::spawn(async move { local.write(Bytes::from(vec![2u8; 4])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let first = remote.read(0, 16).unwrap().await.unwrap();
        assert!(first.iter().all(|&b| b == 1));

        let index = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = remote.read(index, 4).unwrap().await.unwrap();
        assert!(second.iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn test_failed_connection_fails_tickets() {
        let (a, b) = Endpoint::pair(64);
        let remote = DataEndpoints::new(vec![("d".to_string(), b)], 64).unwrap();
        let pending = remote.read(0, 10).unwrap();

        // Closing the far side ends the stream before 10 bytes arrive.
        drop(a);

        assert!(pending.await.is_err());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(remote.is_empty());
        assert!(remote.read(0, 1).is_err());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let (a, b) = Endpoint::pair(64);
        let local = DataEndpoints::new(vec![("d".to_string(), a)], 1024).unwrap();
        drop(b);

        local.write(Bytes::from(vec![0u8; 100])).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), local.failure())
            .await
            .unwrap();
        assert!(matches!(err, ChaoticGoodError::Io(_)));
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_pool_reports_no_failure() {
        let (local, _remote) = pools(1, 1024);
        let empty = DataEndpoints::empty();

        let quiet = async {
            tokio::select! {
                _ = local.failure() => false,
                _ = empty.failure() => false,
                _ = tokio::time::sleep(Duration::from_millis(20)) => true,
            }
        };
        assert!(quiet.await);
    }

    #[tokio::test]
    async fn test_oversized_pool_rejected() {
        let endpoints = (0..=MAX_DATA_CONNECTIONS)
            .map(|i| (format!("d{i}"), Endpoint::pair(1).0))
            .collect();
        assert!(matches!(
            DataEndpoints::new(endpoints, 1024),
            Err(ChaoticGoodError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_orders_by_peer_ids() {
        let (a0, _b0) = Endpoint::pair(64);
        let (a1, _b1) = Endpoint::pair(64);
        let pending = vec![
            PendingConnection::ready("alpha", a0),
            PendingConnection::ready("beta", a1),
        ];
        let order = vec!["beta".to_string(), "alpha".to_string()];

        let pool = DataEndpoints::connect(pending, &order, 1024).await.unwrap();
        assert_eq!(pool.ids(), order);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_id() {
        let (a0, _b0) = Endpoint::pair(64);
        let pending = vec![PendingConnection::ready("alpha", a0)];
        let order = vec!["gamma".to_string()];

        let result = DataEndpoints::connect(pending, &order, 1024).await;
        assert!(matches!(result, Err(ChaoticGoodError::Protocol(_))));
    }
}
