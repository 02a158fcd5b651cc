//! Backpressure handling for data-connection writes.
//!
//! Each data connection owns a byte budget (default 1 MiB). A writer
//! reserves budget for its payload before queueing it and suspends while the
//! budget is exhausted; the connection's writer task releases the budget once
//! the bytes hit the socket, which wakes the next waiter.
//!
//! # Usage
//!
//! ```ignore
//! let budget = BackpressureController::new(1024 * 1024);
//! let guard = budget.reserve(payload.len()).await?;
//! queue.send((payload, guard))?;
//! // ...writer task: write payload, then drop(guard)
//! ```

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ChaoticGoodError, Result};

/// Byte budget shared between a producer and the task draining its queue.
///
/// Cloning shares the same budget.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BackpressureController {
    /// Create a controller holding `capacity` bytes of budget.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Budget currently free.
    #[inline]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Payloads larger than the whole budget reserve the whole budget, so a
    /// single oversized write proceeds alone instead of deadlocking.
    fn permits_for(&self, bytes: usize) -> u32 {
        bytes.min(self.capacity) as u32
    }

    /// Reserve budget for `bytes`, suspending until enough is free.
    ///
    /// Fails with `ConnectionClosed` once the controller is closed.
    pub async fn reserve(&self, bytes: usize) -> Result<BackpressureGuard> {
        let permit = self
            .permits
            .clone()
            .acquire_many_owned(self.permits_for(bytes))
            .await
            .map_err(|_| ChaoticGoodError::ConnectionClosed)?;
        Ok(BackpressureGuard { _permit: permit })
    }

    /// Fail current and future reservations.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Reserved budget; released on drop.
#[derive(Debug)]
pub struct BackpressureGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_controller_creation() {
        let ctrl = BackpressureController::new(100);
        assert_eq!(ctrl.available(), 100);
        assert_eq!(BackpressureController::new(0).available(), 1);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let ctrl = BackpressureController::new(10);

        let a = ctrl.reserve(6).await.unwrap();
        assert_eq!(ctrl.available(), 4);

        drop(a);
        assert_eq!(ctrl.available(), 10);
    }

    #[tokio::test]
    async fn test_oversized_reservation_takes_whole_budget() {
        let ctrl = BackpressureController::new(10);
        let guard = ctrl.reserve(1_000).await.unwrap();
        assert_eq!(ctrl.available(), 0);
        drop(guard);
        assert_eq!(ctrl.available(), 10);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let ctrl1 = BackpressureController::new(10);
        let ctrl2 = ctrl1.clone();

        let _guard = ctrl1.reserve(4).await.unwrap();
        assert_eq!(ctrl2.available(), 6);
    }

    #[tokio::test]
    async fn test_reserve_suspends_until_release() {
        let ctrl = BackpressureController::new(8);
        let held = ctrl.reserve(8).await.unwrap();

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.reserve(4).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let ctrl = BackpressureController::new(1);
        let _held = ctrl.reserve(1).await.unwrap();

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.reserve(1).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        ctrl.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ChaoticGoodError::ConnectionClosed)));
        assert!(matches!(
            ctrl.reserve(1).await,
            Err(ChaoticGoodError::ConnectionClosed)
        ));
    }
}
