//! Applies ordered batches to the partitions a store owns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;

use shardgraph_core::metrics::{BATCH_APPLY_DURATION, PARTITION_WRITE_RETRIES};
use shardgraph_core::{
    BackupEngine, CoreError, CoreResult, OperationBatch, Partition, PartitionId, SnapshotId,
    StoreId,
};

use crate::worker_pool::{join_result, WorkerPool};

/// Owns a store's partitions and its worker pool.
///
/// A batch is done only once every targeted partition accepted it; a failing
/// partition is retried with the same slice until it does, stalling the
/// store rather than dropping data.
pub struct PartitionWriteCoordinator {
    store_id: StoreId,
    partitions: BTreeMap<PartitionId, Arc<dyn Partition>>,
    pool: WorkerPool,
    retry_interval: Duration,
    backup_engines: Mutex<BTreeMap<PartitionId, Arc<dyn BackupEngine>>>,
}

impl PartitionWriteCoordinator {
    /// # Errors
    ///
    /// `ValidationError` if two partitions share an id.
    pub fn new(
        store_id: StoreId,
        partitions: Vec<Arc<dyn Partition>>,
        pool: WorkerPool,
        retry_interval: Duration,
    ) -> CoreResult<Self> {
        let mut by_id = BTreeMap::new();
        for partition in partitions {
            let id = partition.id();
            if by_id.insert(id, partition).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate partition {} in store {}",
                    id, store_id
                )));
            }
        }
        Ok(Self {
            store_id,
            partitions: by_id,
            pool,
            retry_interval,
            backup_engines: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn partitions(&self) -> &BTreeMap<PartitionId, Arc<dyn Partition>> {
        &self.partitions
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    pub fn owns(&self, partition_id: PartitionId) -> bool {
        self.partitions.contains_key(&partition_id)
    }

    /// Writes every partition's slice of a batch at `snapshot_id`.
    ///
    /// Returns whether any partition reported a schema change.
    ///
    /// # Errors
    ///
    /// `ValidationError`, before any write, if the batch targets a partition
    /// this store does not own. Partition failures are retried, not returned.
    pub async fn apply_batch(
        &self,
        snapshot_id: SnapshotId,
        partition_batches: BTreeMap<PartitionId, OperationBatch>,
    ) -> CoreResult<bool> {
        if let Some(unknown) = partition_batches.keys().find(|id| !self.owns(**id)) {
            return Err(CoreError::ValidationError(format!(
                "Partition {} is not owned by store {}",
                unknown, self.store_id
            )));
        }

        let start = Instant::now();
        let mut pending: Vec<(PartitionId, Arc<OperationBatch>)> = partition_batches
            .into_iter()
            .map(|(id, batch)| (id, Arc::new(batch)))
            .collect();
        let mut has_ddl = false;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }
            attempt += 1;

            let handles: Vec<_> = pending
                .iter()
                .map(|(id, batch)| {
                    let partition = self.partitions[id].clone();
                    let batch = batch.clone();
                    self.pool
                        .spawn(async move { partition.write_batch(snapshot_id, &batch).await })
                })
                .collect();

            let mut failed = Vec::new();
            for ((id, batch), handle) in pending.into_iter().zip(handles) {
                match join_result(handle.await) {
                    Ok(ddl) => has_ddl |= ddl,
                    Err(e) => {
                        tracing::warn!(
                            store_id = %self.store_id,
                            partition_id = %id,
                            snapshot_id = %snapshot_id,
                            attempt,
                            error = %e,
                            "Partition write failed, will retry"
                        );
                        PARTITION_WRITE_RETRIES
                            .with_label_values(&[&id.to_string()])
                            .inc();
                        failed.push((id, batch));
                    }
                }
            }
            pending = failed;
        }

        BATCH_APPLY_DURATION
            .with_label_values(&[&self.store_id.to_string()])
            .observe(start.elapsed().as_secs_f64());
        Ok(has_ddl)
    }

    /// Minimum durably applied snapshot id across partitions.
    ///
    /// # Errors
    ///
    /// Any partition recovery failure; the store must not start.
    pub async fn recover(&self) -> CoreResult<SnapshotId> {
        let results = join_all(self.partitions.values().map(|partition| async move {
            (partition.id(), partition.recover().await)
        }))
        .await;

        let mut recovered: Option<SnapshotId> = None;
        for (partition_id, result) in results {
            match result {
                Ok(snapshot_id) => {
                    recovered = Some(recovered.map_or(snapshot_id, |r| r.min(snapshot_id)));
                }
                Err(e) => {
                    tracing::error!(
                        store_id = %self.store_id,
                        partition_id = %partition_id,
                        error = %e,
                        "Partition recovery failed"
                    );
                    return Err(e);
                }
            }
        }

        let recovered = recovered.unwrap_or(SnapshotId::ZERO);
        tracing::info!(
            store_id = %self.store_id,
            snapshot_id = %recovered,
            partitions = self.partitions.len(),
            "Store recovered"
        );
        Ok(recovered)
    }

    /// Opens (once) and returns the backup engine of every partition.
    pub async fn backup_engines(&self) -> CoreResult<BTreeMap<PartitionId, Arc<dyn BackupEngine>>> {
        let mut engines = self.backup_engines.lock().await;
        for (id, partition) in &self.partitions {
            if !engines.contains_key(id) {
                let engine = partition.open_backup_engine().await?;
                engines.insert(*id, engine);
            }
        }
        Ok(engines.clone())
    }
}
