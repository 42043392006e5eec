//! Cluster-wide backup orchestration.
//!
//! A backup is a set of independently created partition backups, one per
//! partition of the cluster, recorded with the query snapshot, queue offsets
//! and schema captured when it was started. Only a backup every store
//! completed is ever persisted; partition backups left behind by a failed
//! attempt are reclaimed by the next garbage collection pass.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use shardgraph_core::meta::{read_json, write_json, BACKUP_INFO_PATH, GLOBAL_BACKUP_ID_PATH};
use shardgraph_core::metrics::{status_label, BACKUPS_RETAINED, BACKUP_OPERATIONS};
use shardgraph_core::{
    BackupInfo, CoreError, CoreResult, GlobalBackupId, MetaStore, PartitionAssignment,
    PartitionBackupId, PartitionId, SchemaSource, StoreBackupClient, StoreBackupId,
};

use crate::snapshot_manager::SnapshotManager;

/// Restored query snapshot id, a JSON number.
pub const RESTORE_QUERY_SNAPSHOT_ID_FILE: &str = "query_snapshot_id";
/// Restored schema, raw bytes.
pub const RESTORE_GRAPH_DEF_FILE: &str = "graph_def_proto_bytes";
/// Restored queue offsets, a JSON array.
pub const RESTORE_QUEUE_OFFSETS_FILE: &str = "queue_offsets";

#[derive(Default)]
struct BackupState {
    started: bool,
    last_global_backup_id: GlobalBackupId,
    infos: Vec<BackupInfo>,
}

pub struct BackupManager {
    meta: Arc<dyn MetaStore>,
    assignment: PartitionAssignment,
    enabled: bool,
    snapshots: Arc<SnapshotManager>,
    schema: Arc<dyn SchemaSource>,
    stores: Vec<Arc<dyn StoreBackupClient>>,
    state: Mutex<BackupState>,
    /// Held shared by every in-flight creation; garbage collection needs it
    /// exclusively.
    creation_gate: RwLock<()>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BackupManager {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        assignment: PartitionAssignment,
        enabled: bool,
        snapshots: Arc<SnapshotManager>,
        schema: Arc<dyn SchemaSource>,
        stores: Vec<Arc<dyn StoreBackupClient>>,
    ) -> Self {
        Self {
            meta,
            assignment,
            enabled,
            snapshots,
            schema,
            stores,
            state: Mutex::new(BackupState::default()),
            creation_gate: RwLock::new(()),
            worker: parking_lot::Mutex::new(None),
        }
    }

    /// Loads the backup id counter and the backup list.
    pub async fn start(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let last_global_backup_id =
            read_json::<GlobalBackupId>(self.meta.as_ref(), GLOBAL_BACKUP_ID_PATH)
                .await?
                .unwrap_or_default();
        let infos = read_json::<Vec<BackupInfo>>(self.meta.as_ref(), BACKUP_INFO_PATH)
            .await?
            .unwrap_or_default();

        tracing::info!(
            last_global_backup_id = %last_global_backup_id,
            backups = infos.len(),
            enabled = self.enabled,
            "Backup manager started"
        );
        BACKUPS_RETAINED.set(infos.len() as i64);
        *state = BackupState {
            started: true,
            last_global_backup_id,
            infos,
        };
        Ok(())
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

    fn ensure_started(state: &BackupState) -> CoreResult<()> {
        if state.started {
            Ok(())
        } else {
            Err(CoreError::invalid_state("backup manager not started"))
        }
    }

    fn record<T>(operation: &'static str, result: &CoreResult<T>) {
        BACKUP_OPERATIONS
            .with_label_values(&[operation, status_label(result)])
            .inc();
    }

    /// Creates a backup of every partition at the current query snapshot.
    ///
    /// # Errors
    ///
    /// `BackupDisabled`, meta store failures, or the first store failure.
    /// The allocated id is consumed either way.
    pub async fn create_new_backup(&self) -> CoreResult<GlobalBackupId> {
        self.ensure_enabled("create")?;
        let _creating = self.creation_gate.read().await;
        let result = self.create_backup_inner().await;
        Self::record("create", &result);
        result
    }

    async fn create_backup_inner(&self) -> CoreResult<GlobalBackupId> {
        let global_backup_id = {
            let mut state = self.state.lock().await;
            Self::ensure_started(&state)?;
            let raw = state
                .last_global_backup_id
                .get()
                .checked_add(1)
                .ok_or_else(|| CoreError::internal("global backup id space exhausted"))?;
            let next = GlobalBackupId::new(raw);
            write_json(self.meta.as_ref(), GLOBAL_BACKUP_ID_PATH, &next).await?;
            state.last_global_backup_id = next;
            next
        };

        let (query_snapshot_id, queue_offsets) = self.snapshots.query_snapshot_with_offsets().await;
        let schema_bytes = self.schema.schema_bytes().await?;

        let results = join_all(
            self.stores
                .iter()
                .map(|store| store.create_store_backup(global_backup_id)),
        )
        .await;

        let mut partition_to_backup_id = BTreeMap::new();
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(store_backup) => {
                    partition_to_backup_id.extend(store_backup.partition_to_backup_id);
                }
                Err(e) => {
                    tracing::error!(
                        global_backup_id = %global_backup_id,
                        store_id = %store.store_id(),
                        error = %e,
                        "Store backup failed, abandoning backup"
                    );
                    return Err(e);
                }
            }
        }

        if let Some(missing) = self
            .assignment
            .all_partitions()
            .find(|p| !partition_to_backup_id.contains_key(p))
        {
            return Err(CoreError::invalid_state(format!(
                "backup {} has no backup of partition {}",
                global_backup_id, missing
            )));
        }

        let info = BackupInfo {
            global_backup_id,
            query_snapshot_id,
            schema_bytes,
            queue_offsets,
            partition_to_backup_id,
            created_at: Utc::now(),
        };

        let mut state = self.state.lock().await;
        let mut infos = state.infos.clone();
        // Concurrent creations may finish out of id order; purge relies on it.
        let position = infos.partition_point(|i| i.global_backup_id < global_backup_id);
        infos.insert(position, info);
        write_json(self.meta.as_ref(), BACKUP_INFO_PATH, &infos).await?;
        state.infos = infos;
        BACKUPS_RETAINED.set(state.infos.len() as i64);

        tracing::info!(
            global_backup_id = %global_backup_id,
            query_snapshot_id = %query_snapshot_id,
            "Created backup"
        );
        Ok(global_backup_id)
    }

    /// Removes one backup from the list.
    pub async fn delete_backup(&self, global_backup_id: GlobalBackupId) -> CoreResult<()> {
        self.ensure_enabled("delete")?;
        let mut state = self.state.lock().await;
        Self::ensure_started(&state)?;

        let Some(position) = state
            .infos
            .iter()
            .position(|info| info.global_backup_id == global_backup_id)
        else {
            return Err(CoreError::not_found("Backup", global_backup_id.to_string()));
        };

        let mut infos = state.infos.clone();
        infos.remove(position);
        let result = write_json(self.meta.as_ref(), BACKUP_INFO_PATH, &infos).await;
        Self::record("delete", &result);
        result?;

        state.infos = infos;
        BACKUPS_RETAINED.set(state.infos.len() as i64);
        tracing::info!(global_backup_id = %global_backup_id, "Deleted backup");
        Ok(())
    }

    /// Keeps only the `keep_alive` most recent backups.
    pub async fn purge_old_backups(&self, keep_alive: usize) -> CoreResult<()> {
        self.ensure_enabled("purge")?;
        let mut state = self.state.lock().await;
        Self::ensure_started(&state)?;

        if state.infos.len() <= keep_alive {
            return Ok(());
        }
        let purged = state.infos.len() - keep_alive;
        let infos = state.infos[purged..].to_vec();
        let result = write_json(self.meta.as_ref(), BACKUP_INFO_PATH, &infos).await;
        Self::record("purge", &result);
        result?;

        state.infos = infos;
        BACKUPS_RETAINED.set(state.infos.len() as i64);
        tracing::info!(purged, kept = keep_alive, "Purged old backups");
        Ok(())
    }

    /// Tells every store which partition backups are still referenced so it
    /// can discard the rest.
    ///
    /// Returns `false` without doing anything while a creation is in flight.
    pub async fn clear_unavailable_store_backups(&self) -> CoreResult<bool> {
        self.ensure_enabled("gc")?;
        let Ok(_gc) = self.creation_gate.try_write() else {
            tracing::debug!("Backup creation in flight, skipping garbage collection");
            return Ok(false);
        };

        let infos = {
            let state = self.state.lock().await;
            Self::ensure_started(&state)?;
            state.infos.clone()
        };

        let mut ready: BTreeMap<PartitionId, BTreeSet<PartitionBackupId>> = self
            .assignment
            .all_partitions()
            .map(|p| (p, BTreeSet::new()))
            .collect();
        for info in &infos {
            for (partition_id, backup_id) in &info.partition_to_backup_id {
                ready.entry(*partition_id).or_default().insert(*backup_id);
            }
        }

        let requests: Vec<_> = self
            .stores
            .iter()
            .map(|store| {
                let owned: BTreeMap<_, _> = self
                    .assignment
                    .partitions_of(store.store_id())
                    .into_iter()
                    .map(|p| (p, ready.get(&p).cloned().unwrap_or_default()))
                    .collect();
                (store, owned)
            })
            .collect();

        let results = join_all(
            requests
                .iter()
                .map(|(store, owned)| store.clear_unavailable_backups(owned)),
        )
        .await;
        let result = results.into_iter().collect::<CoreResult<Vec<()>>>();
        Self::record("gc", &result);
        result?;

        tracing::info!(backups = infos.len(), "Cleared unavailable store backups");
        Ok(true)
    }

    fn store_backup_id(&self, info: &BackupInfo, store: &dyn StoreBackupClient) -> StoreBackupId {
        let partition_to_backup_id = info
            .partition_to_backup_id
            .iter()
            .filter(|(p, _)| self.assignment.store_of(**p) == Some(store.store_id()))
            .map(|(p, b)| (*p, *b))
            .collect();
        StoreBackupId::new(info.global_backup_id, partition_to_backup_id)
    }

    /// Checks every partition backup of a backup.
    pub async fn verify_backup(&self, global_backup_id: GlobalBackupId) -> CoreResult<()> {
        self.ensure_enabled("verify")?;
        let info = self.backup_info(global_backup_id).await?;

        let requests: Vec<_> = self
            .stores
            .iter()
            .map(|store| (store, self.store_backup_id(&info, store.as_ref())))
            .collect();
        let results = join_all(
            requests
                .iter()
                .map(|(store, store_backup_id)| store.verify_store_backup(store_backup_id)),
        )
        .await;
        let result = results.into_iter().collect::<CoreResult<Vec<()>>>().map(|_| ());
        Self::record("verify", &result);
        result
    }

    /// Writes the coordinator's restore payload under `meta_restore_path` and
    /// restores every store's partitions under `store_restore_path`.
    pub async fn restore_from_backup(
        &self,
        global_backup_id: GlobalBackupId,
        meta_restore_path: &Path,
        store_restore_path: &Path,
    ) -> CoreResult<()> {
        self.ensure_enabled("restore")?;
        let info = self.backup_info(global_backup_id).await?;

        tokio::fs::create_dir_all(meta_restore_path).await?;
        tokio::fs::write(
            meta_restore_path.join(RESTORE_QUERY_SNAPSHOT_ID_FILE),
            serde_json::to_vec(&info.query_snapshot_id)?,
        )
        .await?;
        tokio::fs::write(
            meta_restore_path.join(RESTORE_GRAPH_DEF_FILE),
            &info.schema_bytes,
        )
        .await?;
        tokio::fs::write(
            meta_restore_path.join(RESTORE_QUEUE_OFFSETS_FILE),
            serde_json::to_vec(&info.queue_offsets)?,
        )
        .await?;

        let requests: Vec<_> = self
            .stores
            .iter()
            .map(|store| (store, self.store_backup_id(&info, store.as_ref())))
            .collect();
        let results = join_all(requests.iter().map(|(store, store_backup_id)| {
            store.restore_from_store_backup(store_backup_id, store_restore_path)
        }))
        .await;
        let result = results.into_iter().collect::<CoreResult<Vec<()>>>().map(|_| ());
        Self::record("restore", &result);
        result?;

        tracing::info!(
            global_backup_id = %global_backup_id,
            meta_restore_path = %meta_restore_path.display(),
            store_restore_path = %store_restore_path.display(),
            "Restored backup"
        );
        Ok(())
    }

    /// One backup's record.
    pub async fn backup_info(&self, global_backup_id: GlobalBackupId) -> CoreResult<BackupInfo> {
        let state = self.state.lock().await;
        Self::ensure_started(&state)?;
        state
            .infos
            .iter()
            .find(|info| info.global_backup_id == global_backup_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Backup", global_backup_id.to_string()))
    }

    /// Every retained backup, oldest first.
    pub async fn backup_info_list(&self) -> Vec<BackupInfo> {
        self.state.lock().await.infos.clone()
    }

    /// Runs garbage collection every `interval`.
    pub fn start_gc_worker(self: &Arc<Self>, interval: Duration) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::warn!("Backup GC worker already running");
            return;
        }

        let manager = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.clear_unavailable_store_backups().await {
                    tracing::error!(error = %e, "Backup garbage collection failed");
                }
            }
        }));
        tracing::info!("Backup GC worker started (interval: {:?})", interval);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            tracing::info!("Backup GC worker shut down");
        }
    }
}
