//! Bulkhead: bounds concurrent calls and the queue waiting for them.
//!
//! Up to `max_parallel` calls run at once and up to `max_queue` more wait for
//! a slot. A call arriving when both are full is rejected immediately.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;

use crate::error::PolicyError;

#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    semaphore: Semaphore,
    /// Running plus queued calls
    occupancy: AtomicUsize,
    capacity: usize,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_parallel: usize, max_queue: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            name: name.into(),
            semaphore: Semaphore::new(max_parallel),
            occupancy: AtomicUsize::new(0),
            capacity: max_parallel + max_queue,
        }
    }

    /// Calls currently running or queued.
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    // == Run ==
    /// Runs `fut` once a slot is free, or rejects it if the queue is full.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, PolicyError> {
        let _slot = self.enter()?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PolicyError::BulkheadRejected)?;
        Ok(fut.await)
    }

    fn enter(&self) -> Result<Slot<'_>, PolicyError> {
        self.occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .map_err(|occupied| {
                tracing::warn!(client = %self.name, occupied, "Bulkhead rejected call");
                PolicyError::BulkheadRejected
            })?;
        Ok(Slot(&self.occupancy))
    }
}

/// Releases one unit of occupancy on drop, including when the caller's
/// future is cancelled while queued.
struct Slot<'a>(&'a AtomicUsize);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore as Gate;

    #[tokio::test]
    async fn test_runs_when_free() {
        let bulkhead = Bulkhead::new("test", 2, 0);
        assert_eq!(bulkhead.run(async { 1 }).await, Ok(1));
        assert_eq!(bulkhead.occupancy(), 0);
    }

    #[tokio::test]
    async fn test_rejects_beyond_parallel_plus_queue() {
        let bulkhead = Arc::new(Bulkhead::new("test", 2, 1));
        let gate = Arc::new(Gate::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let bulkhead = bulkhead.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .run(async move {
                        let _ = gate.acquire().await;
                    })
                    .await
            }));
        }
        while bulkhead.occupancy() < 3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            bulkhead.run(async {}).await,
            Err(PolicyError::BulkheadRejected)
        );

        gate.add_permits(3);
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(bulkhead.occupancy(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queued_call_frees_slot() {
        let bulkhead = Bulkhead::new("test", 1, 0);
        {
            let pending = bulkhead.run(std::future::pending::<()>());
            tokio::pin!(pending);
            let _ = tokio::time::timeout(std::time::Duration::from_millis(10), &mut pending).await;
            assert_eq!(bulkhead.occupancy(), 1);
        }
        assert_eq!(bulkhead.occupancy(), 0);
    }
}
