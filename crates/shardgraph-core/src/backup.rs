use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GlobalBackupId, PartitionBackupId, PartitionId, SnapshotId};
use crate::snapshot::QueueOffsets;

/// Persisted record of one cluster-wide backup. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub global_backup_id: GlobalBackupId,
    pub query_snapshot_id: SnapshotId,
    pub schema_bytes: Vec<u8>,
    pub queue_offsets: QueueOffsets,
    /// Every partition of the cluster mapped to the id its store assigned.
    pub partition_to_backup_id: BTreeMap<PartitionId, PartitionBackupId>,
    pub created_at: DateTime<Utc>,
}

/// A store's contribution to a [`BackupInfo`]: its local partitions only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreBackupId {
    pub global_backup_id: GlobalBackupId,
    pub partition_to_backup_id: BTreeMap<PartitionId, PartitionBackupId>,
}

impl StoreBackupId {
    #[must_use]
    pub fn new(
        global_backup_id: GlobalBackupId,
        partition_to_backup_id: BTreeMap<PartitionId, PartitionBackupId>,
    ) -> Self {
        Self {
            global_backup_id,
            partition_to_backup_id,
        }
    }
}
