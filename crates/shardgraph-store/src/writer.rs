//! Per-store apply loop.
//!
//! Drains the sort queue, applies each batch through the
//! [`PartitionWriteCoordinator`] and reports progress to the snapshot
//! coordinator. A snapshot is complete on this store once a batch of a
//! higher snapshot has been polled, or once the queue is drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardgraph_core::metrics::SORT_QUEUE_DEPTH;
use shardgraph_core::{
    CommitReport, CoreResult, QueueOffsets, SnapshotCommitter, SnapshotId, StoreDataBatch,
    StoreId,
};

use crate::sort_queue::{Polled, SnapshotSortQueue};
use crate::write_coordinator::PartitionWriteCoordinator;

/// Stops a running [`StoreWriter`] after its current step.
#[derive(Clone, Default)]
pub struct WriterShutdown(Arc<AtomicBool>);

impl WriterShutdown {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, PartialEq, Eq)]
struct Progress {
    snapshot_id: SnapshotId,
    ddl_snapshot_id: SnapshotId,
    queue_offsets: QueueOffsets,
}

pub struct StoreWriter {
    store_id: StoreId,
    coordinator: Arc<PartitionWriteCoordinator>,
    queue: SnapshotSortQueue,
    committer: Arc<dyn SnapshotCommitter>,
    commit_interval: Duration,
    shutdown: WriterShutdown,

    recovered: SnapshotId,
    last_seen: SnapshotId,
    pending_ddl: Option<SnapshotId>,
    offsets: QueueOffsets,
    /// Progress through the newest complete snapshot.
    complete: Progress,
    last_reported: Option<Progress>,
    last_report_at: Option<Instant>,
}

impl StoreWriter {
    /// Recovers the store's partitions and reports the recovered snapshot.
    ///
    /// # Errors
    ///
    /// Propagates partition recovery failures: the store must not start.
    pub async fn start(
        coordinator: Arc<PartitionWriteCoordinator>,
        queue: SnapshotSortQueue,
        committer: Arc<dyn SnapshotCommitter>,
        queue_count: usize,
        commit_interval: Duration,
    ) -> CoreResult<Self> {
        let recovered = coordinator.recover().await?;
        let offsets = QueueOffsets::new(queue_count);
        let mut writer = Self {
            store_id: coordinator.store_id(),
            coordinator,
            queue,
            committer,
            commit_interval,
            shutdown: WriterShutdown::default(),
            recovered,
            last_seen: recovered,
            pending_ddl: None,
            complete: Progress {
                snapshot_id: recovered,
                ddl_snapshot_id: SnapshotId::ZERO,
                queue_offsets: offsets.clone(),
            },
            offsets,
            last_reported: None,
            last_report_at: None,
        };
        writer.report(true).await;
        Ok(writer)
    }

    pub fn shutdown_handle(&self) -> WriterShutdown {
        self.shutdown.clone()
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Newest snapshot completely applied on this store.
    pub fn completed_snapshot_id(&self) -> SnapshotId {
        self.complete.snapshot_id
    }

    /// Runs until the queue is drained or shutdown is requested. Returns the
    /// newest complete snapshot id.
    pub async fn run(mut self) -> SnapshotId {
        tracing::info!(
            store_id = %self.store_id,
            recovered_snapshot_id = %self.recovered,
            "Store writer started"
        );

        while !self.shutdown.is_shutdown() {
            let drained = self.step().await;
            if drained {
                break;
            }
        }

        self.report(true).await;
        tracing::info!(
            store_id = %self.store_id,
            snapshot_id = %self.complete.snapshot_id,
            "Store writer stopped"
        );
        self.complete.snapshot_id
    }

    /// Polls and handles one entry. Returns `true` once drained.
    pub async fn step(&mut self) -> bool {
        let drained = match self.queue.poll().await {
            Polled::Batch(batch) => {
                self.process(batch).await;
                false
            }
            Polled::Idle => false,
            Polled::Drained => {
                self.mark_complete(self.last_seen);
                self.complete.queue_offsets = self.offsets.clone();
                true
            }
        };

        SORT_QUEUE_DEPTH
            .with_label_values(&[&self.store_id.to_string()])
            .set(self.queue.queued() as i64);
        self.report(drained).await;
        drained
    }

    async fn process(&mut self, batch: StoreDataBatch) {
        if batch.snapshot_id > self.last_seen {
            // Offsets consumed so far all belong to snapshots up to last_seen.
            self.complete.queue_offsets = self.offsets.clone();
            self.mark_complete(batch.snapshot_id.prev());
            self.last_seen = batch.snapshot_id;
        }

        if batch.snapshot_id > self.recovered && !batch.partition_batches.is_empty() {
            match self
                .coordinator
                .apply_batch(batch.snapshot_id, batch.partition_batches)
                .await
            {
                Ok(true) => {
                    self.pending_ddl = Some(
                        self.pending_ddl
                            .map_or(batch.snapshot_id, |d| d.max(batch.snapshot_id)),
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        store_id = %self.store_id,
                        snapshot_id = %batch.snapshot_id,
                        queue_id = %batch.queue_id,
                        error = %e,
                        "Dropping batch that cannot be applied"
                    );
                }
            }
        }

        self.offsets.set(batch.queue_id, batch.offset);
    }

    fn mark_complete(&mut self, snapshot_id: SnapshotId) {
        if snapshot_id > self.complete.snapshot_id {
            self.complete.snapshot_id = snapshot_id;
        }
        if let Some(ddl) = self.pending_ddl {
            if ddl <= self.complete.snapshot_id {
                self.complete.ddl_snapshot_id = self.complete.ddl_snapshot_id.max(ddl);
                self.pending_ddl = None;
            }
        }
    }

    /// Sends a commit report if progress moved and the commit interval
    /// elapsed (or `force`). Failures are retried on the next step.
    async fn report(&mut self, force: bool) {
        if self.last_reported.as_ref() == Some(&self.complete) {
            return;
        }
        let due = self
            .last_report_at
            .map_or(true, |at| at.elapsed() >= self.commit_interval);
        if !force && !due {
            return;
        }

        let report = CommitReport {
            store_id: self.store_id,
            snapshot_id: self.complete.snapshot_id,
            ddl_snapshot_id: self.complete.ddl_snapshot_id,
            queue_offsets: self.complete.queue_offsets.clone(),
        };
        self.last_report_at = Some(Instant::now());
        match self.committer.commit_snapshot_id(report).await {
            Ok(()) => {
                tracing::debug!(
                    store_id = %self.store_id,
                    snapshot_id = %self.complete.snapshot_id,
                    ddl_snapshot_id = %self.complete.ddl_snapshot_id,
                    "Reported commit"
                );
                self.last_reported = Some(self.complete.clone());
            }
            Err(e) => {
                tracing::warn!(
                    store_id = %self.store_id,
                    snapshot_id = %self.complete.snapshot_id,
                    error = %e,
                    "Commit report failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::MemoryPartition;
    use crate::worker_pool::WorkerPool;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shardgraph_core::{
        Operation, OperationBatch, OperationKind, Partition, PartitionId, QueueId,
    };

    #[derive(Default)]
    struct RecordingCommitter {
        reports: Mutex<Vec<CommitReport>>,
    }

    #[async_trait]
    impl SnapshotCommitter for RecordingCommitter {
        async fn commit_snapshot_id(&self, report: CommitReport) -> CoreResult<()> {
            self.reports.lock().push(report);
            Ok(())
        }
    }

    fn batch(snapshot: u64, queue: u32, offset: i64, kind: Option<OperationKind>) -> StoreDataBatch {
        let b = StoreDataBatch::new(SnapshotId::new(snapshot), QueueId::new(queue), offset);
        match kind {
            Some(kind) => b.with_partition(
                PartitionId::new(0),
                OperationBatch::new(vec![Operation::new(kind, b"x".to_vec())]),
            ),
            None => b,
        }
    }

    async fn writer_with(
        partition: Arc<MemoryPartition>,
        committer: Arc<RecordingCommitter>,
    ) -> (crate::sort_queue::SortQueueWriter, StoreWriter) {
        let pool = WorkerPool::new(StoreId::new(0), 2).unwrap();
        let coordinator = Arc::new(
            PartitionWriteCoordinator::new(
                StoreId::new(0),
                vec![partition as Arc<dyn Partition>],
                pool,
                Duration::from_millis(5),
            )
            .unwrap(),
        );
        let (queue_writer, queue) =
            SnapshotSortQueue::channel(2, 16, Duration::from_millis(20)).unwrap();
        let writer = StoreWriter::start(coordinator, queue, committer, 2, Duration::ZERO)
            .await
            .unwrap();
        (queue_writer, writer)
    }

    #[tokio::test]
    async fn test_reports_completed_snapshots_and_ddl() {
        let partition = Arc::new(MemoryPartition::new(PartitionId::new(0)));
        let committer = Arc::new(RecordingCommitter::default());
        let (queue_writer, writer) = writer_with(partition.clone(), committer.clone()).await;

        let q0 = QueueId::new(0);
        let q1 = QueueId::new(1);
        queue_writer.offer(q0, batch(1, 0, 0, Some(OperationKind::OverwriteVertex))).await.unwrap();
        queue_writer.offer(q1, batch(1, 1, 0, Some(OperationKind::CreateVertexType))).await.unwrap();
        queue_writer.offer(q0, batch(2, 0, 1, None)).await.unwrap();
        queue_writer.offer(q1, batch(2, 1, 1, Some(OperationKind::UpdateVertex))).await.unwrap();
        drop(queue_writer);

        let completed = writer.run().await;
        assert_eq!(completed, SnapshotId::new(2));

        let reports = committer.reports.lock().clone();
        assert_eq!(reports.first().unwrap().snapshot_id, SnapshotId::ZERO);

        let at_one = reports
            .iter()
            .find(|r| r.snapshot_id == SnapshotId::new(1))
            .unwrap();
        assert_eq!(at_one.ddl_snapshot_id, SnapshotId::new(1));
        assert_eq!(at_one.queue_offsets.as_slice(), &[0, 0]);

        let last = reports.last().unwrap();
        assert_eq!(last.snapshot_id, SnapshotId::new(2));
        assert_eq!(last.queue_offsets.as_slice(), &[1, 1]);
        for report in &reports {
            assert!(report.ddl_snapshot_id <= report.snapshot_id);
        }
        assert_eq!(partition.applied().len(), 3);
    }

    #[tokio::test]
    async fn test_skips_batches_already_recovered() {
        let partition = Arc::new(MemoryPartition::with_recovered(
            PartitionId::new(0),
            SnapshotId::new(5),
        ));
        let committer = Arc::new(RecordingCommitter::default());
        let (queue_writer, writer) = writer_with(partition.clone(), committer.clone()).await;

        queue_writer
            .offer(QueueId::new(0), batch(5, 0, 0, Some(OperationKind::OverwriteEdge)))
            .await
            .unwrap();
        queue_writer
            .offer(QueueId::new(0), batch(6, 0, 1, Some(OperationKind::OverwriteEdge)))
            .await
            .unwrap();
        drop(queue_writer);

        assert_eq!(writer.run().await, SnapshotId::new(6));
        let applied = partition.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].snapshot_id, SnapshotId::new(6));
        assert_eq!(committer.reports.lock()[0].snapshot_id, SnapshotId::new(5));
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_writer() {
        let partition = Arc::new(MemoryPartition::new(PartitionId::new(0)));
        let committer = Arc::new(RecordingCommitter::default());
        let (_queue_writer, writer) = writer_with(partition, committer).await;

        let shutdown = writer.shutdown_handle();
        let handle = tokio::spawn(writer.run());
        shutdown.shutdown();

        let completed = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed, SnapshotId::ZERO);
    }
}
