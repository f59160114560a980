//! Bounded worker pool.
//!
//! Work is spawned immediately but only makes progress while holding one
//! of `size` permits, so at most `size` futures run at a time.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by running work.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only fails after
            // the pool itself is gone.
            let _permit = permits.acquire_owned().await.ok()?;
            Some(fut.await)
        })
    }

    /// Like [`spawn`](Self::spawn), but gives up with `None` when `cancel`
    /// fires before a permit is free. `fut` is never polled in that case.
    pub fn spawn_until<F>(&self, cancel: CancellationToken, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = permits.acquire_owned() => permit.ok()?,
            };
            if cancel.is_cancelled() {
                return None;
            }
            Some(fut.await)
        })
    }
}
