//! Bounded concurrency gate
//!
//! A counting lock capping how many part operations run at once. Unlike a
//! plain semaphore it can be closed: once the consuming side of a transfer
//! has failed, `close` permanently releases every producer blocked on
//! `acquire` so none of them waits on a result that will never be read.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::TransferError;

#[derive(Clone)]
pub(crate) struct ConcurrencyGate {
    slots: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Wait for a free slot. Fails once the gate is closed.
    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Canceled("concurrency gate closed".into()))
    }

    /// Permanently release all current and future waiters.
    pub(crate) fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_bounds_concurrency() {
        let gate = ConcurrencyGate::new(2);
        let _a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let gate = ConcurrencyGate::new(1);
        let permit = gate.acquire().await.unwrap();
        drop(permit);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(TransferError::Canceled(_))));
        drop(held);
    }
}
