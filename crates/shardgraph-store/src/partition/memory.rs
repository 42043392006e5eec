//! In-memory partition and backup engine
//!
//! Keeps every applied operation in memory and produces checksummed backup
//! images. Supports deterministic fault injection for every partition and
//! backup operation so retry and fan-out failure paths can be exercised
//! without a real storage engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use shardgraph_core::{
    BackupEngine, CoreError, CoreResult, Operation, OperationBatch, Partition, PartitionBackupId,
    PartitionId, SnapshotId,
};

/// File written into a partition's restore directory.
pub const RESTORED_IMAGE_FILE: &str = "partition.json";

/// Operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Write,
    Recover,
    CreateBackup,
    VerifyBackup,
    RestoreBackup,
    ClearBackups,
}

#[derive(Default)]
struct Faults {
    pending: Mutex<HashMap<FaultPoint, usize>>,
    calls: Mutex<HashMap<FaultPoint, usize>>,
}

impl Faults {
    /// Counts the call and consumes one injected failure, if any.
    fn check(&self, partition_id: PartitionId, point: FaultPoint) -> CoreResult<()> {
        *self.calls.lock().entry(point).or_insert(0) += 1;

        let mut pending = self.pending.lock();
        match pending.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(CoreError::partition(
                    partition_id,
                    format!("injected {:?} failure", point),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// One applied operation with the snapshot it was applied at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub snapshot_id: SnapshotId,
    pub operation: Operation,
}

#[derive(Default)]
struct PartitionState {
    applied: Vec<AppliedOperation>,
    latest_snapshot_id: SnapshotId,
    recovered_snapshot_id: SnapshotId,
}

struct Shared {
    id: PartitionId,
    state: Mutex<PartitionState>,
    faults: Faults,
}

/// Partition backed by an in-memory operation log.
pub struct MemoryPartition {
    shared: Arc<Shared>,
    engine: Mutex<Option<Arc<MemoryBackupEngine>>>,
}

impl MemoryPartition {
    pub fn new(id: PartitionId) -> Self {
        Self::with_recovered(id, SnapshotId::ZERO)
    }

    /// A partition that has already durably applied everything through
    /// `snapshot_id`.
    pub fn with_recovered(id: PartitionId, snapshot_id: SnapshotId) -> Self {
        let state = PartitionState {
            applied: Vec::new(),
            latest_snapshot_id: snapshot_id,
            recovered_snapshot_id: snapshot_id,
        };
        Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(state),
                faults: Faults::default(),
            }),
            engine: Mutex::new(None),
        }
    }

    /// Makes the next `times` calls of `point` fail.
    pub fn fail_next(&self, point: FaultPoint, times: usize) {
        self.shared.faults.pending.lock().insert(point, times);
    }

    /// Number of calls of `point`, failed ones included.
    pub fn call_count(&self, point: FaultPoint) -> usize {
        self.shared
            .faults
            .calls
            .lock()
            .get(&point)
            .copied()
            .unwrap_or(0)
    }

    pub fn applied(&self) -> Vec<AppliedOperation> {
        self.shared.state.lock().applied.clone()
    }

    /// Snapshot of the newest applied batch.
    pub fn latest_snapshot_id(&self) -> SnapshotId {
        self.shared.state.lock().latest_snapshot_id
    }

    fn engine(&self) -> Arc<MemoryBackupEngine> {
        self.engine
            .lock()
            .get_or_insert_with(|| Arc::new(MemoryBackupEngine::new(self.shared.clone())))
            .clone()
    }

    /// Typed handle on the backup engine, for inspection in tests.
    pub fn memory_backup_engine(&self) -> Arc<MemoryBackupEngine> {
        self.engine()
    }
}

#[async_trait]
impl Partition for MemoryPartition {
    fn id(&self) -> PartitionId {
        self.shared.id
    }

    async fn write_batch(
        &self,
        snapshot_id: SnapshotId,
        batch: &OperationBatch,
    ) -> CoreResult<bool> {
        self.shared.faults.check(self.shared.id, FaultPoint::Write)?;

        let mut state = self.shared.state.lock();
        if snapshot_id > state.latest_snapshot_id {
            // Batches arrive in snapshot order: everything below is complete.
            state.recovered_snapshot_id = snapshot_id.prev();
            state.latest_snapshot_id = snapshot_id;
        }
        state
            .applied
            .extend(batch.operations.iter().cloned().map(|operation| AppliedOperation {
                snapshot_id,
                operation,
            }));
        Ok(batch.has_ddl())
    }

    async fn recover(&self) -> CoreResult<SnapshotId> {
        self.shared.faults.check(self.shared.id, FaultPoint::Recover)?;
        Ok(self.shared.state.lock().recovered_snapshot_id)
    }

    async fn open_backup_engine(&self) -> CoreResult<Arc<dyn BackupEngine>> {
        Ok(self.engine())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionImage {
    partition_id: PartitionId,
    snapshot_id: SnapshotId,
    operations: Vec<AppliedOperation>,
}

struct StoredBackup {
    image: Vec<u8>,
    checksum: String,
}

fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Backup engine of a [`MemoryPartition`].
///
/// Backup ids start at 1 and increase per partition.
pub struct MemoryBackupEngine {
    partition: Arc<Shared>,
    backups: Mutex<BTreeMap<PartitionBackupId, StoredBackup>>,
    next_id: Mutex<i32>,
}

impl MemoryBackupEngine {
    fn new(partition: Arc<Shared>) -> Self {
        Self {
            partition,
            backups: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Flips a byte of a stored image so verification fails.
    pub fn corrupt_backup(&self, backup_id: PartitionBackupId) -> bool {
        match self.backups.lock().get_mut(&backup_id) {
            Some(stored) if !stored.image.is_empty() => {
                stored.image[0] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    fn stored_image(&self, backup_id: PartitionBackupId) -> CoreResult<Vec<u8>> {
        let backups = self.backups.lock();
        let stored = backups
            .get(&backup_id)
            .ok_or_else(|| CoreError::not_found("PartitionBackup", backup_id.to_string()))?;
        if checksum(&stored.image) != stored.checksum {
            return Err(CoreError::partition(
                self.partition.id,
                format!("backup {} checksum mismatch", backup_id),
            ));
        }
        Ok(stored.image.clone())
    }
}

#[async_trait]
impl BackupEngine for MemoryBackupEngine {
    async fn create_backup(&self) -> CoreResult<PartitionBackupId> {
        let partition_id = self.partition.id;
        self.partition
            .faults
            .check(partition_id, FaultPoint::CreateBackup)?;

        let image = {
            let state = self.partition.state.lock();
            PartitionImage {
                partition_id,
                snapshot_id: state.latest_snapshot_id,
                operations: state.applied.clone(),
            }
        };
        let image = serde_json::to_vec(&image)?;

        let backup_id = {
            let mut next_id = self.next_id.lock();
            let id = PartitionBackupId::new(*next_id);
            *next_id += 1;
            id
        };
        let stored = StoredBackup {
            checksum: checksum(&image),
            image,
        };
        self.backups.lock().insert(backup_id, stored);

        tracing::debug!(
            partition_id = %partition_id,
            backup_id = %backup_id,
            "Created partition backup"
        );
        Ok(backup_id)
    }

    async fn verify_backup(&self, backup_id: PartitionBackupId) -> CoreResult<()> {
        self.partition
            .faults
            .check(self.partition.id, FaultPoint::VerifyBackup)?;
        self.stored_image(backup_id).map(|_| ())
    }

    async fn restore_from_backup(
        &self,
        restore_path: &Path,
        backup_id: PartitionBackupId,
    ) -> CoreResult<()> {
        self.partition
            .faults
            .check(self.partition.id, FaultPoint::RestoreBackup)?;
        let image = self.stored_image(backup_id)?;

        tokio::fs::create_dir_all(restore_path).await?;
        tokio::fs::write(restore_path.join(RESTORED_IMAGE_FILE), &image).await?;
        Ok(())
    }

    async fn clear_unavailable_backups(
        &self,
        ready_ids: &BTreeSet<PartitionBackupId>,
    ) -> CoreResult<()> {
        self.partition
            .faults
            .check(self.partition.id, FaultPoint::ClearBackups)?;

        let mut backups = self.backups.lock();
        let before = backups.len();
        backups.retain(|id, _| ready_ids.contains(id));
        let removed = before - backups.len();
        if removed > 0 {
            tracing::debug!(
                partition_id = %self.partition.id,
                removed,
                "Cleared unavailable partition backups"
            );
        }
        Ok(())
    }

    async fn backup_ids(&self) -> CoreResult<Vec<PartitionBackupId>> {
        Ok(self.backups.lock().keys().copied().collect())
    }
}
