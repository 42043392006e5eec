//! Bounded per-store worker pool shared by writes, backups and restores.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use shardgraph_core::{CoreError, CoreResult, StoreId};

/// Runs partition tasks on the runtime with at most `size` in flight.
#[derive(Clone)]
pub struct WorkerPool {
    store_id: StoreId,
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// # Errors
    ///
    /// `ValidationError` if `size` is zero.
    pub fn new(store_id: StoreId, size: usize) -> CoreResult<Self> {
        if size == 0 {
            return Err(CoreError::ValidationError(
                "worker pool size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            store_id,
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running task.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Spawns `task`; it starts once a permit is free and holds it until done.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<CoreResult<T>>
    where
        F: Future<Output = CoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let store_id = self.store_id;
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                CoreError::Closed(format!("worker pool of store {} closed", store_id))
            })?;
            task.await
        })
    }
}

/// Flattens a joined pool task into its result.
pub(crate) fn join_result<T>(
    joined: Result<CoreResult<T>, tokio::task::JoinError>,
) -> CoreResult<T> {
    joined.map_err(|e| CoreError::internal(format!("Worker task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounds_concurrency() {
        let pool = WorkerPool::new(StoreId::new(0), 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            join_result(handle.await).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(WorkerPool::new(StoreId::new(0), 0).is_err());
    }
}
