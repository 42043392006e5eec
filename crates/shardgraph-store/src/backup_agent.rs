//! Per-store backup fan-out.
//!
//! Every operation runs one task per local partition on the store's worker
//! pool. The first failing task completes the operation with its error and
//! raises a shared `finished` flag; tasks that have not started yet see the
//! flag and skip their work, while tasks already running finish normally.
//! Success is delivered once the last task decrements the remaining counter
//! to zero.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use shardgraph_core::metrics::{status_label, BACKUP_OPERATIONS};
use shardgraph_core::{
    Completion, CoreError, CoreResult, GlobalBackupId, PartitionBackupId, PartitionId,
    StoreBackupClient, StoreBackupId, StoreId,
};

use crate::write_coordinator::PartitionWriteCoordinator;

pub struct BackupAgent {
    store_id: StoreId,
    coordinator: Arc<PartitionWriteCoordinator>,
    enabled: bool,
}

impl BackupAgent {
    pub fn new(coordinator: Arc<PartitionWriteCoordinator>, enabled: bool) -> Self {
        Self {
            store_id: coordinator.store_id(),
            coordinator,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_enabled(&self, operation: &'static str) -> CoreResult<()> {
        if self.enabled {
            Ok(())
        } else {
            BACKUP_OPERATIONS
                .with_label_values(&[operation, "disabled"])
                .inc();
            Err(CoreError::BackupDisabled)
        }
    }

    fn ensure_owned<'a>(
        &self,
        partitions: impl IntoIterator<Item = &'a PartitionId>,
    ) -> CoreResult<()> {
        for partition_id in partitions {
            if !self.coordinator.owns(*partition_id) {
                return Err(CoreError::ValidationError(format!(
                    "Partition {} is not owned by store {}",
                    partition_id, self.store_id
                )));
            }
        }
        Ok(())
    }

    /// Runs one task per partition with first-error-wins completion.
    async fn fan_out<T, F, Fut>(
        &self,
        operation: &'static str,
        tasks: Vec<(PartitionId, F)>,
    ) -> CoreResult<BTreeMap<PartitionId, T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if tasks.is_empty() {
            return Ok(BTreeMap::new());
        }

        let (completion, receiver) = Completion::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let remaining = Arc::new(AtomicUsize::new(tasks.len()));
        let results = Arc::new(Mutex::new(BTreeMap::new()));

        for (partition_id, task) in tasks {
            let completion = completion.clone();
            let finished = finished.clone();
            let remaining = remaining.clone();
            let results = results.clone();
            let store_id = self.store_id;

            // Detached: dispatched tasks run to completion even after a
            // sibling failed.
            drop(self.coordinator.pool().spawn(async move {
                if finished.load(Ordering::SeqCst) {
                    tracing::debug!(
                        store_id = %store_id,
                        partition_id = %partition_id,
                        operation,
                        "Skipping partition task after earlier failure"
                    );
                    return Ok(());
                }

                match task().await {
                    Ok(value) => {
                        results.lock().insert(partition_id, value);
                        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                            let all = std::mem::take(&mut *results.lock());
                            completion.complete(Ok(all));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            store_id = %store_id,
                            partition_id = %partition_id,
                            operation,
                            error = %e,
                            "Partition task failed"
                        );
                        if !finished.swap(true, Ordering::SeqCst) {
                            completion.complete(Err(e));
                        }
                    }
                }
                Ok(())
            }));
        }

        let result = receiver.wait().await;
        BACKUP_OPERATIONS
            .with_label_values(&[operation, status_label(&result)])
            .inc();
        result
    }

    /// Backs up every local partition under `global_backup_id`.
    pub async fn create_store_backup(
        &self,
        global_backup_id: GlobalBackupId,
    ) -> CoreResult<StoreBackupId> {
        self.ensure_enabled("store_create")?;

        let engines = self.coordinator.backup_engines().await?;
        let tasks = engines
            .into_iter()
            .map(|(partition_id, engine)| {
                (partition_id, move || async move { engine.create_backup().await })
            })
            .collect();
        let partition_to_backup_id = self.fan_out("store_create", tasks).await?;

        tracing::info!(
            store_id = %self.store_id,
            global_backup_id = %global_backup_id,
            partitions = partition_to_backup_id.len(),
            "Created store backup"
        );
        Ok(StoreBackupId::new(global_backup_id, partition_to_backup_id))
    }

    /// Verifies every partition backup of a store backup.
    pub async fn verify_store_backup(&self, store_backup_id: &StoreBackupId) -> CoreResult<()> {
        self.ensure_enabled("store_verify")?;
        self.ensure_owned(store_backup_id.partition_to_backup_id.keys())?;

        let engines = self.coordinator.backup_engines().await?;
        let tasks = store_backup_id
            .partition_to_backup_id
            .iter()
            .filter_map(|(partition_id, backup_id)| {
                let engine = engines.get(partition_id)?.clone();
                let backup_id = *backup_id;
                Some((*partition_id, move || async move {
                    engine.verify_backup(backup_id).await
                }))
            })
            .collect();
        self.fan_out("store_verify", tasks).await?;
        Ok(())
    }

    /// Discards every partition backup not listed as ready. Partitions missing
    /// from `ready` are left untouched.
    pub async fn clear_unavailable_backups(
        &self,
        ready: &BTreeMap<PartitionId, BTreeSet<PartitionBackupId>>,
    ) -> CoreResult<()> {
        self.ensure_enabled("store_clear")?;
        self.ensure_owned(ready.keys())?;

        let engines = self.coordinator.backup_engines().await?;
        let tasks = ready
            .iter()
            .filter_map(|(partition_id, ready_ids)| {
                let engine = engines.get(partition_id)?.clone();
                let ready_ids = ready_ids.clone();
                Some((*partition_id, move || async move {
                    engine.clear_unavailable_backups(&ready_ids).await
                }))
            })
            .collect();
        self.fan_out("store_clear", tasks).await?;
        Ok(())
    }

    /// Restores each partition of a store backup into
    /// `restore_root/<partition_id>`.
    ///
    /// # Errors
    ///
    /// `ValidationError`, before any work, if the backup does not cover
    /// exactly this store's partitions.
    pub async fn restore_from_store_backup(
        &self,
        store_backup_id: &StoreBackupId,
        restore_root: &Path,
    ) -> CoreResult<()> {
        self.ensure_enabled("store_restore")?;

        let expected = self.coordinator.partitions().len();
        let actual = store_backup_id.partition_to_backup_id.len();
        if actual != expected {
            return Err(CoreError::ValidationError(format!(
                "Store backup has {} partitions but store {} owns {}",
                actual, self.store_id, expected
            )));
        }
        self.ensure_owned(store_backup_id.partition_to_backup_id.keys())?;

        let engines = self.coordinator.backup_engines().await?;
        let tasks = store_backup_id
            .partition_to_backup_id
            .iter()
            .filter_map(|(partition_id, backup_id)| {
                let engine = engines.get(partition_id)?.clone();
                let backup_id = *backup_id;
                let restore_path = restore_root.join(partition_id.to_string());
                Some((*partition_id, move || async move {
                    engine.restore_from_backup(&restore_path, backup_id).await
                }))
            })
            .collect();
        self.fan_out("store_restore", tasks).await?;

        tracing::info!(
            store_id = %self.store_id,
            global_backup_id = %store_backup_id.global_backup_id,
            restore_root = %restore_root.display(),
            "Restored store backup"
        );
        Ok(())
    }
}

#[async_trait]
impl StoreBackupClient for BackupAgent {
    fn store_id(&self) -> StoreId {
        self.store_id
    }

    async fn create_store_backup(
        &self,
        global_backup_id: GlobalBackupId,
    ) -> CoreResult<StoreBackupId> {
        BackupAgent::create_store_backup(self, global_backup_id).await
    }

    async fn verify_store_backup(&self, store_backup_id: &StoreBackupId) -> CoreResult<()> {
        BackupAgent::verify_store_backup(self, store_backup_id).await
    }

    async fn clear_unavailable_backups(
        &self,
        ready: &BTreeMap<PartitionId, BTreeSet<PartitionBackupId>>,
    ) -> CoreResult<()> {
        BackupAgent::clear_unavailable_backups(self, ready).await
    }

    async fn restore_from_store_backup(
        &self,
        store_backup_id: &StoreBackupId,
        restore_root: &Path,
    ) -> CoreResult<()> {
        BackupAgent::restore_from_store_backup(self, store_backup_id, restore_root).await
    }
}
