use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backup::StoreBackupId;
use crate::batch::OperationBatch;
use crate::error::CoreResult;
use crate::ids::{GlobalBackupId, PartitionBackupId, PartitionId, QueueId, SnapshotId, StoreId};
use crate::snapshot::CommitReport;

/// Durable key/byte-value store holding all coordination state.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Returns whether a value exists at `path`.
    async fn exists(&self, path: &str) -> CoreResult<bool>;

    /// Reads the value at `path`; `NotFound` if absent.
    async fn read(&self, path: &str) -> CoreResult<Vec<u8>>;

    /// Replaces the value at `path`. Must be atomic: readers observe either
    /// the old or the new value.
    async fn write(&self, path: &str, value: &[u8]) -> CoreResult<()>;

    /// Deletes the value at `path`; deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> CoreResult<()>;
}

/// One shard of the graph with its own storage engine.
#[async_trait]
pub trait Partition: Send + Sync {
    fn id(&self) -> PartitionId;

    /// Applies a batch at `snapshot_id`. Returns whether it contained a
    /// schema change.
    async fn write_batch(&self, snapshot_id: SnapshotId, batch: &OperationBatch)
        -> CoreResult<bool>;

    /// Last snapshot id this partition has fully and durably applied.
    async fn recover(&self) -> CoreResult<SnapshotId>;

    /// Opens (or returns the already opened) backup engine.
    async fn open_backup_engine(&self) -> CoreResult<Arc<dyn BackupEngine>>;
}

/// Per-partition backup engine.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Creates a new backup of the partition's current state.
    async fn create_backup(&self) -> CoreResult<PartitionBackupId>;

    /// Checks the integrity of an existing backup.
    async fn verify_backup(&self, backup_id: PartitionBackupId) -> CoreResult<()>;

    /// Materializes a backup into `restore_path`.
    async fn restore_from_backup(
        &self,
        restore_path: &Path,
        backup_id: PartitionBackupId,
    ) -> CoreResult<()>;

    /// Discards every backup not listed in `ready_ids`.
    async fn clear_unavailable_backups(
        &self,
        ready_ids: &BTreeSet<PartitionBackupId>,
    ) -> CoreResult<()>;

    /// Backup ids currently held, ascending.
    async fn backup_ids(&self) -> CoreResult<Vec<PartitionBackupId>>;
}

/// Receiver of store commit reports.
#[async_trait]
pub trait SnapshotCommitter: Send + Sync {
    async fn commit_snapshot_id(&self, report: CommitReport) -> CoreResult<()>;
}

/// Notified of every query snapshot advance, in snapshot order.
///
/// `ddl_snapshot_id` is `Some` only for the first advance that includes a
/// new schema. Returning an error makes the coordinator redeliver the same
/// advance.
#[async_trait]
pub trait SnapshotListener: Send + Sync {
    async fn on_snapshot_advanced(
        &self,
        query_snapshot_id: SnapshotId,
        ddl_snapshot_id: Option<SnapshotId>,
    ) -> CoreResult<()>;
}

/// The backup operations a store offers to the cluster coordinator, local or
/// behind an RPC stub.
#[async_trait]
pub trait StoreBackupClient: Send + Sync {
    fn store_id(&self) -> StoreId;

    async fn create_store_backup(
        &self,
        global_backup_id: GlobalBackupId,
    ) -> CoreResult<StoreBackupId>;

    async fn verify_store_backup(&self, store_backup_id: &StoreBackupId) -> CoreResult<()>;

    async fn clear_unavailable_backups(
        &self,
        ready: &BTreeMap<PartitionId, BTreeSet<PartitionBackupId>>,
    ) -> CoreResult<()>;

    async fn restore_from_store_backup(
        &self,
        store_backup_id: &StoreBackupId,
        restore_root: &Path,
    ) -> CoreResult<()>;
}

/// Source of the serialized graph schema captured by backups.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn schema_bytes(&self) -> CoreResult<Vec<u8>>;
}

/// Entry point of the ingest path: tags operations with the current write
/// snapshot and delivers them to every store.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Writes per-partition operations through `queue_id`. Returns the
    /// snapshot id the operations were tagged with.
    async fn write(
        &self,
        queue_id: QueueId,
        partition_batches: BTreeMap<PartitionId, OperationBatch>,
    ) -> CoreResult<SnapshotId>;

    /// Writes the same operations to every partition of the cluster.
    async fn write_to_all_partitions(
        &self,
        queue_id: QueueId,
        batch: OperationBatch,
    ) -> CoreResult<SnapshotId>;
}
