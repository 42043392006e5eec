//! Backup orchestration across stores
//!
//! Two stores with two in-memory partitions each, driven directly through
//! the backup manager:
//! 1. Create, list, purge and delete
//! 2. Failed creation persists nothing and leaves orphans for GC
//! 3. GC is skipped while a creation is in flight
//! 4. Verify detects a corrupted partition backup
//! 5. Restore writes the coordinator payload and every partition image
//! 6. Disabled backups are rejected

use async_trait::async_trait;
use shardgraph_coordinator::{
    BackupManager, SnapshotManager, RESTORE_GRAPH_DEF_FILE, RESTORE_QUERY_SNAPSHOT_ID_FILE,
    RESTORE_QUEUE_OFFSETS_FILE,
};
use shardgraph_core::meta::{read_json, BACKUP_INFO_PATH, GLOBAL_BACKUP_ID_PATH};
use shardgraph_core::{
    BackupEngine, BackupInfo, CoreError, CoreResult, GlobalBackupId, Partition,
    PartitionAssignment, PartitionBackupId, PartitionId, SchemaSource, StoreBackupClient,
    StoreBackupId, StoreId,
};
use shardgraph_store::partition::RESTORED_IMAGE_FILE;
use shardgraph_store::{
    BackupAgent, FaultPoint, MemoryMetaStore, MemoryPartition, PartitionWriteCoordinator,
    WorkerPool,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

const SCHEMA: &[u8] = b"{\"vertex_types\":[\"person\"]}";

struct StaticSchema;

#[async_trait]
impl SchemaSource for StaticSchema {
    async fn schema_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(SCHEMA.to_vec())
    }
}

/// Holds `create_store_backup` until released, for every backup or only
/// for `only`.
struct GatedStore {
    inner: Arc<BackupAgent>,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
    only: Option<GlobalBackupId>,
}

#[async_trait]
impl StoreBackupClient for GatedStore {
    fn store_id(&self) -> StoreId {
        self.inner.store_id()
    }

    async fn create_store_backup(
        &self,
        global_backup_id: GlobalBackupId,
    ) -> CoreResult<StoreBackupId> {
        if self.only.is_some_and(|only| only != global_backup_id) {
            return self.inner.create_store_backup(global_backup_id).await;
        }
        self.entered.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| CoreError::Closed("gate closed".to_string()))?;
        self.inner.create_store_backup(global_backup_id).await
    }

    async fn verify_store_backup(&self, store_backup_id: &StoreBackupId) -> CoreResult<()> {
        self.inner.verify_store_backup(store_backup_id).await
    }

    async fn clear_unavailable_backups(
        &self,
        ready: &BTreeMap<PartitionId, BTreeSet<PartitionBackupId>>,
    ) -> CoreResult<()> {
        StoreBackupClient::clear_unavailable_backups(self.inner.as_ref(), ready).await
    }

    async fn restore_from_store_backup(
        &self,
        store_backup_id: &StoreBackupId,
        restore_root: &Path,
    ) -> CoreResult<()> {
        self.inner
            .restore_from_store_backup(store_backup_id, restore_root)
            .await
    }
}

struct Fixture {
    meta: Arc<MemoryMetaStore>,
    partitions: Vec<Arc<MemoryPartition>>,
    agents: Vec<Arc<BackupAgent>>,
    manager: Arc<BackupManager>,
}

fn build_agents(
    assignment: PartitionAssignment,
    enabled: bool,
) -> (Vec<Arc<MemoryPartition>>, Vec<Arc<BackupAgent>>) {
    let mut all_partitions = Vec::new();
    let mut agents = Vec::new();
    for store_id in assignment.all_stores() {
        let partitions: Vec<Arc<MemoryPartition>> = assignment
            .partitions_of(store_id)
            .into_iter()
            .map(|id| Arc::new(MemoryPartition::new(id)))
            .collect();
        let coordinator = PartitionWriteCoordinator::new(
            store_id,
            partitions
                .iter()
                .map(|p| p.clone() as Arc<dyn Partition>)
                .collect(),
            WorkerPool::new(store_id, 2).unwrap(),
            Duration::from_millis(5),
        )
        .unwrap();
        agents.push(Arc::new(BackupAgent::new(Arc::new(coordinator), enabled)));
        all_partitions.extend(partitions);
    }
    (all_partitions, agents)
}

async fn fixture_with(enabled: bool, wrap: impl Fn(Arc<BackupAgent>) -> Arc<dyn StoreBackupClient>) -> Fixture {
    let assignment = PartitionAssignment::new(2, 4).unwrap();
    let meta = Arc::new(MemoryMetaStore::new());
    let snapshots = Arc::new(SnapshotManager::new(
        meta.clone(),
        2,
        2,
        Duration::from_millis(5),
    ));
    snapshots.start().await.unwrap();

    let (partitions, agents) = build_agents(assignment, enabled);
    let manager = Arc::new(BackupManager::new(
        meta.clone(),
        assignment,
        enabled,
        snapshots,
        Arc::new(StaticSchema),
        agents.iter().cloned().map(&wrap).collect(),
    ));
    manager.start().await.unwrap();

    Fixture {
        meta,
        partitions,
        agents,
        manager,
    }
}

async fn fixture() -> Fixture {
    fixture_with(true, |agent| agent as Arc<dyn StoreBackupClient>).await
}

fn ids(infos: &[BackupInfo]) -> Vec<i32> {
    infos.iter().map(|info| info.global_backup_id.get()).collect()
}

async fn engine_backup_ids(partition: &MemoryPartition) -> Vec<PartitionBackupId> {
    partition.memory_backup_engine().backup_ids().await.unwrap()
}

#[tokio::test]
async fn test_create_purge_delete() {
    let f = fixture().await;

    let first = f.manager.create_new_backup().await.unwrap();
    assert_eq!(first, GlobalBackupId::new(1));

    let info = f.manager.backup_info(first).await.unwrap();
    assert_eq!(info.partition_to_backup_id.len(), 4);
    assert!(info
        .partition_to_backup_id
        .values()
        .all(|id| *id == PartitionBackupId::new(1)));
    assert_eq!(info.schema_bytes, SCHEMA);
    assert_eq!(info.queue_offsets.as_slice(), &[-1, -1]);

    let second = f.manager.create_new_backup().await.unwrap();
    assert_eq!(second, GlobalBackupId::new(2));
    assert_eq!(ids(&f.manager.backup_info_list().await), vec![1, 2]);

    f.manager.purge_old_backups(1).await.unwrap();
    assert_eq!(ids(&f.manager.backup_info_list().await), vec![2]);

    // Purging with a larger budget keeps everything.
    f.manager.purge_old_backups(5).await.unwrap();
    assert_eq!(ids(&f.manager.backup_info_list().await), vec![2]);

    f.manager.delete_backup(second).await.unwrap();
    assert!(f.manager.backup_info_list().await.is_empty());
    assert!(matches!(
        f.manager.delete_backup(second).await,
        Err(CoreError::NotFound { .. })
    ));

    let persisted: Vec<BackupInfo> = read_json(f.meta.as_ref(), BACKUP_INFO_PATH)
        .await
        .unwrap()
        .unwrap();
    assert!(persisted.is_empty());
    let last_id: GlobalBackupId = read_json(f.meta.as_ref(), GLOBAL_BACKUP_ID_PATH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last_id, GlobalBackupId::new(2));
}

#[tokio::test]
async fn test_backup_list_survives_restart() {
    let f = fixture().await;
    f.manager.create_new_backup().await.unwrap();
    f.manager.create_new_backup().await.unwrap();

    let snapshots = Arc::new(SnapshotManager::new(
        f.meta.clone(),
        2,
        2,
        Duration::from_millis(5),
    ));
    snapshots.start().await.unwrap();
    let restarted = BackupManager::new(
        f.meta.clone(),
        PartitionAssignment::new(2, 4).unwrap(),
        true,
        snapshots,
        Arc::new(StaticSchema),
        f.agents
            .iter()
            .map(|a| a.clone() as Arc<dyn StoreBackupClient>)
            .collect(),
    );
    restarted.start().await.unwrap();

    assert_eq!(ids(&restarted.backup_info_list().await), vec![1, 2]);
    assert_eq!(
        restarted.create_new_backup().await.unwrap(),
        GlobalBackupId::new(3)
    );
}

#[tokio::test]
async fn test_failed_creation_leaves_orphans_for_gc() {
    let f = fixture().await;
    f.partitions[3].fail_next(FaultPoint::CreateBackup, 1);

    assert!(f.manager.create_new_backup().await.is_err());
    assert!(f.manager.backup_info_list().await.is_empty());
    // Partitions of the healthy store were backed up anyway.
    assert!(!engine_backup_ids(&f.partitions[0]).await.is_empty());

    assert!(f.manager.clear_unavailable_store_backups().await.unwrap());
    for partition in &f.partitions {
        assert!(engine_backup_ids(partition).await.is_empty());
    }

    // The failed attempt consumed its id.
    assert_eq!(
        f.manager.create_new_backup().await.unwrap(),
        GlobalBackupId::new(2)
    );
}

#[tokio::test]
async fn test_gc_keeps_referenced_backups() {
    let f = fixture().await;
    let first = f.manager.create_new_backup().await.unwrap();
    f.manager.create_new_backup().await.unwrap();
    f.manager.delete_backup(first).await.unwrap();

    assert!(f.manager.clear_unavailable_store_backups().await.unwrap());
    for partition in &f.partitions {
        assert_eq!(
            engine_backup_ids(partition).await,
            vec![PartitionBackupId::new(2)]
        );
    }
}

#[tokio::test]
async fn test_gc_skipped_while_creation_in_flight() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let f = {
        let entered = entered.clone();
        let gate = gate.clone();
        fixture_with(true, move |agent| {
            Arc::new(GatedStore {
                inner: agent,
                entered: entered.clone(),
                gate: gate.clone(),
                only: None,
            }) as Arc<dyn StoreBackupClient>
        })
        .await
    };

    let creating = {
        let manager = f.manager.clone();
        tokio::spawn(async move { manager.create_new_backup().await })
    };
    entered.notified().await;

    assert!(!f.manager.clear_unavailable_store_backups().await.unwrap());

    gate.add_permits(2);
    let id = creating.await.unwrap().unwrap();
    assert_eq!(id, GlobalBackupId::new(1));

    assert!(f.manager.clear_unavailable_store_backups().await.unwrap());
    for partition in &f.partitions {
        assert_eq!(
            engine_backup_ids(partition).await,
            vec![PartitionBackupId::new(1)]
        );
    }
}

#[tokio::test]
async fn test_backups_listed_in_id_order() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let f = {
        let entered = entered.clone();
        let gate = gate.clone();
        fixture_with(true, move |agent| {
            Arc::new(GatedStore {
                inner: agent,
                entered: entered.clone(),
                gate: gate.clone(),
                only: Some(GlobalBackupId::new(1)),
            }) as Arc<dyn StoreBackupClient>
        })
        .await
    };

    let slow = {
        let manager = f.manager.clone();
        tokio::spawn(async move { manager.create_new_backup().await })
    };
    entered.notified().await;

    // Backup 2 finishes while backup 1 is still being taken.
    assert_eq!(
        f.manager.create_new_backup().await.unwrap(),
        GlobalBackupId::new(2)
    );
    gate.add_permits(2);
    assert_eq!(slow.await.unwrap().unwrap(), GlobalBackupId::new(1));
    assert_eq!(ids(&f.manager.backup_info_list().await), vec![1, 2]);

    f.manager.purge_old_backups(1).await.unwrap();
    assert_eq!(ids(&f.manager.backup_info_list().await), vec![2]);
}

#[tokio::test]
async fn test_verify_detects_corruption() {
    let f = fixture().await;
    let id = f.manager.create_new_backup().await.unwrap();
    f.manager.verify_backup(id).await.unwrap();

    assert!(f.partitions[2]
        .memory_backup_engine()
        .corrupt_backup(PartitionBackupId::new(1)));
    assert!(matches!(
        f.manager.verify_backup(id).await,
        Err(CoreError::PartitionFailure { .. })
    ));
    assert!(matches!(
        f.manager.verify_backup(GlobalBackupId::new(9)).await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_restore_writes_every_file() {
    let f = fixture().await;
    let id = f.manager.create_new_backup().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");
    let store_path = dir.path().join("store");
    f.manager
        .restore_from_backup(id, &meta_path, &store_path)
        .await
        .unwrap();

    let query: u64 =
        serde_json::from_slice(&std::fs::read(meta_path.join(RESTORE_QUERY_SNAPSHOT_ID_FILE)).unwrap())
            .unwrap();
    assert_eq!(query, 0);
    assert_eq!(
        std::fs::read(meta_path.join(RESTORE_GRAPH_DEF_FILE)).unwrap(),
        SCHEMA
    );
    let offsets: Vec<i64> =
        serde_json::from_slice(&std::fs::read(meta_path.join(RESTORE_QUEUE_OFFSETS_FILE)).unwrap())
            .unwrap();
    assert_eq!(offsets, vec![-1, -1]);

    for partition in &f.partitions {
        let image = store_path
            .join(partition.id().to_string())
            .join(RESTORED_IMAGE_FILE);
        assert!(image.exists(), "missing {}", image.display());
    }
}

#[tokio::test]
async fn test_disabled_backups_are_rejected() {
    let f = fixture_with(false, |agent| agent as Arc<dyn StoreBackupClient>).await;

    assert!(matches!(
        f.manager.create_new_backup().await,
        Err(CoreError::BackupDisabled)
    ));
    assert!(matches!(
        f.manager.clear_unavailable_store_backups().await,
        Err(CoreError::BackupDisabled)
    ));
    assert!(matches!(
        f.agents[0].create_store_backup(GlobalBackupId::new(1)).await,
        Err(CoreError::BackupDisabled)
    ));
    for partition in &f.partitions {
        assert_eq!(partition.call_count(FaultPoint::CreateBackup), 0);
    }
}
