//! Deterministic k-way merge of per-queue batch streams.
//!
//! Every store receives the same batches from the same queues and must apply
//! them in the same order. The merge emits batches in non-decreasing
//! `(snapshot_id, -queue_id)` order: within one snapshot the highest queue
//! is drained first, then the next lower one, without any cross-store
//! communication.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use shardgraph_core::{CoreError, CoreResult, QueueId, SnapshotId, StoreDataBatch};

/// Result of one [`SnapshotSortQueue::poll`].
#[derive(Debug)]
pub enum Polled {
    /// Next batch in global order.
    Batch(StoreDataBatch),
    /// Nothing ready within the wait timeout.
    Idle,
    /// Every producer is gone and every buffered batch was consumed.
    Drained,
}

/// Producer side: one bounded channel per queue.
#[derive(Clone)]
pub struct SortQueueWriter {
    senders: Arc<Vec<mpsc::Sender<StoreDataBatch>>>,
    queued: Arc<AtomicUsize>,
    wait: Duration,
}

impl SortQueueWriter {
    /// Enqueues `batch` into the channel of `queue_id`, waiting up to the
    /// configured timeout for space.
    ///
    /// Returns `Ok(false)` when the channel stayed full (backpressure).
    ///
    /// # Errors
    ///
    /// `ValidationError` for an unknown queue or a batch tagged with another
    /// queue, `Closed` once the consumer is gone.
    pub async fn offer(&self, queue_id: QueueId, batch: StoreDataBatch) -> CoreResult<bool> {
        let sender = self.senders.get(queue_id.index()).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Unknown queue {} (queue count {})",
                queue_id,
                self.senders.len()
            ))
        })?;
        if batch.queue_id != queue_id {
            return Err(CoreError::ValidationError(format!(
                "Batch tagged with queue {} offered to queue {}",
                batch.queue_id, queue_id
            )));
        }

        // Counted before the send so the consumer never decrements first.
        self.queued.fetch_add(1, Ordering::SeqCst);
        match sender.send_timeout(batch, self.wait).await {
            Ok(()) => Ok(true),
            Err(SendTimeoutError::Timeout(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Ok(false)
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(CoreError::Closed(format!(
                    "sort queue consumer dropped (queue {})",
                    queue_id
                )))
            }
        }
    }

    pub fn queue_count(&self) -> usize {
        self.senders.len()
    }
}

enum Pulled {
    Batch(StoreDataBatch),
    Closed,
    Timeout,
}

/// Consumer side of the merge.
pub struct SnapshotSortQueue {
    receivers: Vec<mpsc::Receiver<StoreDataBatch>>,
    heads: Vec<Option<StoreDataBatch>>,
    closed: Vec<bool>,
    current_snapshot_id: Option<SnapshotId>,
    current_queue_idx: usize,
    queued: Arc<AtomicUsize>,
    wait: Duration,
}

impl SnapshotSortQueue {
    /// Creates the writer/queue pair for `queue_count` queues, each a bounded
    /// channel of `capacity` batches. `wait` bounds every offer and poll.
    ///
    /// # Errors
    ///
    /// `ValidationError` if `queue_count` or `capacity` is zero.
    pub fn channel(
        queue_count: usize,
        capacity: usize,
        wait: Duration,
    ) -> CoreResult<(SortQueueWriter, SnapshotSortQueue)> {
        if queue_count == 0 {
            return Err(CoreError::ValidationError(
                "queue_count must be > 0".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(CoreError::ValidationError(
                "capacity must be > 0".to_string(),
            ));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..queue_count).map(|_| mpsc::channel(capacity)).unzip();
        let queued = Arc::new(AtomicUsize::new(0));

        let writer = SortQueueWriter {
            senders: Arc::new(senders),
            queued: queued.clone(),
            wait,
        };
        let queue = SnapshotSortQueue {
            receivers,
            heads: vec![None; queue_count],
            closed: vec![false; queue_count],
            current_snapshot_id: None,
            current_queue_idx: queue_count - 1,
            queued,
            wait,
        };
        Ok((writer, queue))
    }

    /// Batches buffered in channels and cached heads.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Snapshot id the merge is currently emitting, `None` before bootstrap.
    pub fn current_snapshot_id(&self) -> Option<SnapshotId> {
        self.current_snapshot_id
    }

    /// Returns the next batch in global order.
    pub async fn poll(&mut self) -> Polled {
        if self.current_snapshot_id.is_none() {
            if let Some(polled) = self.bootstrap().await {
                return polled;
            }
        }
        let Some(mut current) = self.current_snapshot_id else {
            return Polled::Drained;
        };

        loop {
            if self.is_drained() {
                return Polled::Drained;
            }

            let idx = self.current_queue_idx;
            let head = match self.heads[idx].take() {
                Some(head) => head,
                None if self.closed[idx] => {
                    current = self.advance(current);
                    continue;
                }
                None => match self.pull(idx).await {
                    Pulled::Batch(batch) => batch,
                    Pulled::Closed => {
                        self.closed[idx] = true;
                        current = self.advance(current);
                        continue;
                    }
                    Pulled::Timeout => return Polled::Idle,
                },
            };

            match head.snapshot_id.cmp(&current) {
                CmpOrdering::Equal => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Polled::Batch(head);
                }
                CmpOrdering::Greater => {
                    self.heads[idx] = Some(head);
                    current = self.advance(current);
                }
                CmpOrdering::Less => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    tracing::warn!(
                        queue_id = idx,
                        snapshot_id = %head.snapshot_id,
                        current_snapshot_id = %current,
                        "Discarding out-of-order batch"
                    );
                }
            }
        }
    }

    /// Pulls a head from every open queue and starts the merge at the
    /// smallest one. Returns `Some` when the poll must end here.
    async fn bootstrap(&mut self) -> Option<Polled> {
        for idx in 0..self.receivers.len() {
            if self.heads[idx].is_some() || self.closed[idx] {
                continue;
            }
            match self.pull(idx).await {
                Pulled::Batch(batch) => self.heads[idx] = Some(batch),
                Pulled::Closed => self.closed[idx] = true,
                Pulled::Timeout => return Some(Polled::Idle),
            }
        }

        match self.min_head() {
            Some(min) => {
                tracing::debug!(snapshot_id = %min, "Sort queue bootstrapped");
                self.current_snapshot_id = Some(min);
                self.current_queue_idx = self.receivers.len() - 1;
                None
            }
            None => Some(Polled::Drained),
        }
    }

    /// Moves to the next lower queue; wrapping past 0 moves to the next
    /// snapshot.
    fn advance(&mut self, current: SnapshotId) -> SnapshotId {
        if self.current_queue_idx > 0 {
            self.current_queue_idx -= 1;
            return current;
        }

        self.current_queue_idx = self.receivers.len() - 1;
        let mut next = current.next();
        let every_open_queue_has_head = self
            .heads
            .iter()
            .zip(self.closed.iter())
            .all(|(head, closed)| head.is_some() || *closed);
        if every_open_queue_has_head {
            if let Some(min) = self.min_head() {
                next = next.max(min);
            }
        }
        self.current_snapshot_id = Some(next);
        next
    }

    async fn pull(&mut self, idx: usize) -> Pulled {
        match tokio::time::timeout(self.wait, self.receivers[idx].recv()).await {
            Ok(Some(batch)) => Pulled::Batch(batch),
            Ok(None) => Pulled::Closed,
            Err(_) => Pulled::Timeout,
        }
    }

    fn min_head(&self) -> Option<SnapshotId> {
        self.heads
            .iter()
            .flatten()
            .map(|batch| batch.snapshot_id)
            .min()
    }

    fn is_drained(&self) -> bool {
        self.closed.iter().all(|closed| *closed) && self.heads.iter().all(Option::is_none)
    }
}
