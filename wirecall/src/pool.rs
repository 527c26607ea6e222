//! Bounded worker pool.
//!
//! At most `max_workers` handlers run at once. Calls that find every worker
//! busy wait in a queue of at most `max_queued` entries; a call that finds the
//! queue full is rejected on the spot with `RESOURCE_EXHAUSTED`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use wirecall_core::{ErrorClass, Status};

#[derive(Debug)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
    max_queued: Option<usize>,
    queued: Arc<AtomicUsize>,
}

/// A call's place in the queue; released on drop.
#[derive(Debug)]
pub(crate) struct QueueSlot {
    queued: Arc<AtomicUsize>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of admission.
#[derive(Debug)]
pub(crate) enum Admission {
    /// A worker was free.
    Ready(OwnedSemaphorePermit),
    /// Every worker is busy; the call holds a queue slot and must wait.
    Queued(QueueSlot),
}

impl WorkerPool {
    pub(crate) fn new(max_workers: usize, max_queued: Option<usize>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            max_queued,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Admit a call without waiting. Fails with `RESOURCE_EXHAUSTED` when
    /// every worker is busy and the queue is full.
    pub(crate) fn admit(&self) -> Result<Admission, Status> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(Admission::Ready(permit)),
            Err(TryAcquireError::Closed) => return Err(Status::unavailable("worker pool is closed")),
            Err(TryAcquireError::NoPermits) => {}
        }

        let limit = self.max_queued.unwrap_or(usize::MAX);
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| Status::from_class(ErrorClass::Resource, "concurrent RPC limit exceeded"))?;

        Ok(Admission::Queued(QueueSlot {
            queued: self.queued.clone(),
        }))
    }

    /// Wait for a worker. The queue slot is released once the wait ends,
    /// whether or not it succeeded.
    pub(crate) async fn wait(&self, slot: QueueSlot) -> Result<OwnedSemaphorePermit, Status> {
        let permit = self.permits.clone().acquire_owned().await;
        drop(slot);
        permit.map_err(|_| Status::unavailable("worker pool is closed"))
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }
}
