//! Outbound frame queue and the write loop draining it.
//!
//! # Architecture
//!
//! ```text
//! Call 1 ─┐
//! Call 2 ─┼─► mpsc::Sender<Frame> (bounded) ─► write loop ─► TransportWriter
//! Call N ─┘
//! ```
//!
//! The queue is shared by every stream of a transport. When it is full,
//! senders suspend; each frame the write loop takes frees one slot and wakes
//! one waiting sender. Frames of one stream keep their submission order.

use tokio::sync::{mpsc, watch};

use crate::error::{ChaoticGoodError, Result};
use crate::multiplex::ConnectivityState;
use crate::protocol::Frame;
use crate::transport::TransportWriter;

/// Handle for queueing frames to the write loop.
///
/// Cheap to clone; every call of a transport holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Frame>,
}

impl WriterHandle {
    /// Queue a frame, suspending while the queue is full.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ChaoticGoodError::TransportShutdown)
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(QueueFull)` immediately if at capacity.
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChaoticGoodError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChaoticGoodError::TransportShutdown,
        })
    }

    /// Frames queued and not yet taken by the write loop.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Create the bounded outbound queue.
pub(crate) fn outbound_queue(capacity: usize) -> (WriterHandle, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (WriterHandle { tx }, rx)
}

/// Write queued frames until shutdown, the first write error, or the failure
/// of any data connection.
///
/// On error the queue is closed so further sends fail fast; the caller turns
/// the error into a transport abort.
pub(crate) async fn write_loop(
    mut rx: mpsc::Receiver<Frame>,
    mut writer: TransportWriter,
    mut state: watch::Receiver<ConnectivityState>,
) -> Result<()> {
    tracing::debug!("Write loop started");

    loop {
        let frame = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == ConnectivityState::Shutdown) => break,
            e = writer.data_failure() => {
                rx.close();
                return Err(e);
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = writer.write_frame(&frame).await {
            rx.close();
            return Err(e);
        }
    }

    rx.close();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Control shutdown failed: {}", e);
    }
    tracing::debug!("Write loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::config::NegotiatedConfig;
    use crate::endpoint::{ControlEndpoint, DataEndpoints, Endpoint};
    use crate::transport::ChaoticGoodTransport;

    fn cancel(stream_id: u32) -> Frame {
        Frame::Cancel { stream_id }
    }

    #[tokio::test]
    async fn test_pending_count() {
        let (handle, _rx) = outbound_queue(4);
        assert_eq!(handle.pending_count(), 0);

        handle.send(cancel(1)).await.unwrap();
        handle.send(cancel(2)).await.unwrap();
        assert_eq!(handle.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (handle, _rx) = outbound_queue(1);
        handle.try_send(cancel(1)).unwrap();
        assert_eq!(handle.pending_count(), 1);

        let result = handle.try_send(cancel(2));
        assert!(matches!(result, Err(ChaoticGoodError::QueueFull)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (handle, rx) = outbound_queue(1);
        drop(rx);
        assert!(matches!(
            handle.send(cancel(1)).await,
            Err(ChaoticGoodError::TransportShutdown)
        ));
    }

    #[tokio::test]
    async fn test_producer_suspends_when_full() {
        let (handle, mut rx) = outbound_queue(1);
        handle.send(cancel(1)).await.unwrap();

        let blocked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(cancel(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await, Some(cancel(1)));
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rx.recv().await, Some(cancel(2)));
    }

    #[tokio::test]
    async fn test_one_producer_resumes_per_drained_slot() {
        let (handle, mut rx) = outbound_queue(1);
        handle.send(cancel(1)).await.unwrap();

        let producers: Vec<_> = (2..=4u32)
            .map(|id| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.send(cancel(id)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(producers.iter().all(|p| !p.is_finished()));

        for drained in 1..=3usize {
            rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let finished = producers.iter().filter(|p| p.is_finished()).count();
            assert_eq!(finished, drained);
        }
    }

    #[tokio::test]
    async fn test_write_loop_writes_in_order_and_stops_on_shutdown() {
        let (a, b) = Endpoint::pair(4096);
        let config = NegotiatedConfig::default();
        let (_reader, writer) =
            ChaoticGoodTransport::new(ControlEndpoint::new(a), DataEndpoints::empty(), config)
                .into_split();
        let mut peer = ControlEndpoint::new(b);

        let (handle, rx) = outbound_queue(8);
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Ready);
        let task = tokio::spawn(write_loop(rx, writer, state_rx));

        for i in 1..=3u32 {
            handle
                .send(Frame::Message {
                    stream_id: i,
                    payload: Bytes::from(vec![i as u8; i as usize]),
                })
                .await
                .unwrap();
        }
        for i in 1..=3u32 {
            let (header, payload) = peer.read_frame().await.unwrap();
            assert_eq!(header.stream_id, i);
            assert_eq!(payload.len(), i as usize);
        }

        state_tx.send(ConnectivityState::Shutdown).unwrap();
        task.await.unwrap().unwrap();
        assert!(handle.send(cancel(1)).await.is_err());
        // The control write side was shut down.
        assert!(matches!(
            peer.read_frame().await,
            Err(ChaoticGoodError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_loop_fails_when_peer_gone() {
        let (a, b) = Endpoint::pair(64);
        let (_reader, writer) = ChaoticGoodTransport::new(
            ControlEndpoint::new(a),
            DataEndpoints::empty(),
            NegotiatedConfig::default(),
        )
        .into_split();
        drop(b);

        let (handle, rx) = outbound_queue(8);
        let (_state_tx, state_rx) = watch::channel(ConnectivityState::Ready);
        let task = tokio::spawn(write_loop(rx, writer, state_rx));

        handle.send(cancel(1)).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            handle.send(cancel(2)).await,
            Err(ChaoticGoodError::TransportShutdown)
        ));
    }
}
