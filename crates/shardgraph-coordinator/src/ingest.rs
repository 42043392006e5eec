//! Ingest routing.
//!
//! Every routed write is tagged with the current write snapshot id and
//! delivered to the sort queue of every store, so all stores see the same
//! per-queue sequence. Stores that own none of the touched partitions still
//! receive the batch, with no partition operations, to keep their queue
//! offsets and snapshot progress in step.
//!
//! Whenever the write snapshot id increases, a marker batch is pushed
//! through every queue. This lets stores complete a snapshot even when a
//! queue carries no data.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use shardgraph_core::{
    BatchSink, CoreError, CoreResult, OperationBatch, PartitionAssignment, PartitionId, QueueId,
    QueueOffsets, SnapshotId, StoreDataBatch, StoreId,
};
use shardgraph_store::SortQueueWriter;

use crate::snapshot_manager::SnapshotManager;

pub struct IngestRouter {
    assignment: PartitionAssignment,
    snapshots: Arc<SnapshotManager>,
    /// One writer per store, `None` once closed.
    writers: parking_lot::RwLock<Option<Arc<Vec<SortQueueWriter>>>>,
    /// Next offset of each queue. Held while a queue's batch is delivered.
    cursors: Vec<Mutex<i64>>,
    marker_worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl IngestRouter {
    /// Creates a router resuming every queue after its persisted offset.
    ///
    /// # Errors
    ///
    /// `ValidationError` if the writers do not match the cluster layout.
    pub fn new(
        assignment: PartitionAssignment,
        snapshots: Arc<SnapshotManager>,
        writers: Vec<SortQueueWriter>,
        offsets: &QueueOffsets,
    ) -> CoreResult<Self> {
        if writers.len() != assignment.store_count() as usize {
            return Err(CoreError::ValidationError(format!(
                "Expected {} store writers, got {}",
                assignment.store_count(),
                writers.len()
            )));
        }
        if let Some(writer) = writers.iter().find(|w| w.queue_count() != offsets.len()) {
            return Err(CoreError::ValidationError(format!(
                "Store writer has {} queues, cluster has {}",
                writer.queue_count(),
                offsets.len()
            )));
        }

        let cursors = offsets
            .as_slice()
            .iter()
            .map(|offset| Mutex::new(offset + 1))
            .collect();
        Ok(Self {
            assignment,
            snapshots,
            writers: parking_lot::RwLock::new(Some(Arc::new(writers))),
            cursors,
            marker_worker: parking_lot::Mutex::new(None),
        })
    }

    pub fn queue_count(&self) -> usize {
        self.cursors.len()
    }

    fn writers(&self) -> CoreResult<Arc<Vec<SortQueueWriter>>> {
        self.writers
            .read()
            .clone()
            .ok_or_else(|| CoreError::Closed("ingest router closed".to_string()))
    }

    fn cursor(&self, queue_id: QueueId) -> CoreResult<&Mutex<i64>> {
        self.cursors.get(queue_id.index()).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Unknown queue {} (queue count {})",
                queue_id,
                self.cursors.len()
            ))
        })
    }

    /// Writes per-partition operations through `queue_id`. Returns the
    /// snapshot id they were tagged with.
    ///
    /// # Errors
    ///
    /// `ValidationError` for an unknown queue or partition, `Closed` after
    /// [`close`](Self::close).
    pub async fn route(
        &self,
        queue_id: QueueId,
        partition_batches: BTreeMap<PartitionId, OperationBatch>,
    ) -> CoreResult<SnapshotId> {
        let cursor = self.cursor(queue_id)?;
        let mut by_store: BTreeMap<StoreId, BTreeMap<PartitionId, OperationBatch>> =
            BTreeMap::new();
        for (partition_id, batch) in partition_batches {
            let store_id = self.assignment.store_of(partition_id).ok_or_else(|| {
                CoreError::ValidationError(format!("Unknown partition {}", partition_id))
            })?;
            by_store
                .entry(store_id)
                .or_default()
                .insert(partition_id, batch);
        }
        let writers = self.writers()?;

        let mut next_offset = cursor.lock().await;
        let snapshot_id = self.snapshots.write_snapshot_id().await;
        let mut accepted = false;
        let mut offered = Ok(());
        for (idx, writer) in writers.iter().enumerate() {
            let store_id = StoreId::new(idx as u32);
            let mut batch = StoreDataBatch::new(snapshot_id, queue_id, *next_offset);
            batch.partition_batches = by_store.remove(&store_id).unwrap_or_default();
            if let Err(e) = Self::offer(writer, store_id, batch).await {
                offered = Err(e);
                break;
            }
            accepted = true;
        }
        // Stores that took the batch own this offset now.
        if accepted {
            *next_offset += 1;
        }
        offered?;

        tracing::trace!(
            queue_id = %queue_id,
            snapshot_id = %snapshot_id,
            offset = *next_offset - 1,
            "Routed batch"
        );
        Ok(snapshot_id)
    }

    /// Pushes a marker at the current write snapshot through every queue.
    ///
    /// # Errors
    ///
    /// `Closed` once the router or a store queue is gone.
    pub async fn emit_markers(&self) -> CoreResult<SnapshotId> {
        let writers = self.writers()?;
        let mut snapshot_id = SnapshotId::ZERO;
        for (q, cursor) in self.cursors.iter().enumerate() {
            let queue_id = QueueId::new(q as u32);
            let next_offset = cursor.lock().await;
            snapshot_id = self.snapshots.write_snapshot_id().await;
            for (idx, writer) in writers.iter().enumerate() {
                let batch = StoreDataBatch::new(snapshot_id, queue_id, *next_offset - 1);
                Self::offer(writer, StoreId::new(idx as u32), batch).await?;
            }
        }
        Ok(snapshot_id)
    }

    async fn offer(
        writer: &SortQueueWriter,
        store_id: StoreId,
        batch: StoreDataBatch,
    ) -> CoreResult<()> {
        let queue_id = batch.queue_id;
        let mut attempts = 0u32;
        while !writer.offer(queue_id, batch.clone()).await? {
            attempts += 1;
            if attempts == 1 {
                tracing::debug!(
                    store_id = %store_id,
                    queue_id = %queue_id,
                    "Store sort queue full, waiting"
                );
            }
        }
        Ok(())
    }

    /// Emits markers on every write snapshot increase until closed.
    pub fn start_marker_worker(self: &Arc<Self>) {
        let mut worker = self.marker_worker.lock();
        if worker.is_some() {
            tracing::warn!("Marker worker already running");
            return;
        }

        let router = Arc::clone(self);
        let mut receiver = self.snapshots.subscribe_write_snapshot();
        *worker = Some(tokio::spawn(async move {
            loop {
                let _ = receiver.borrow_and_update();
                match router.emit_markers().await {
                    Ok(snapshot_id) => {
                        tracing::trace!(snapshot_id = %snapshot_id, "Emitted markers");
                    }
                    Err(CoreError::Closed(_)) => break,
                    Err(e) => tracing::warn!(error = %e, "Failed to emit markers"),
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        }));
        tracing::info!("Marker worker started");
    }

    /// Stops the marker worker and releases the store queues. Stores drain
    /// what was already delivered, then stop.
    pub fn close(&self) {
        if let Some(handle) = self.marker_worker.lock().take() {
            handle.abort();
        }
        if self.writers.write().take().is_some() {
            tracing::info!("Ingest router closed");
        }
    }
}

#[async_trait]
impl BatchSink for IngestRouter {
    async fn write(
        &self,
        queue_id: QueueId,
        partition_batches: BTreeMap<PartitionId, OperationBatch>,
    ) -> CoreResult<SnapshotId> {
        self.route(queue_id, partition_batches).await
    }

    async fn write_to_all_partitions(
        &self,
        queue_id: QueueId,
        batch: OperationBatch,
    ) -> CoreResult<SnapshotId> {
        let partition_batches = self
            .assignment
            .all_partitions()
            .map(|partition_id| (partition_id, batch.clone()))
            .collect();
        self.route(queue_id, partition_batches).await
    }
}
