//! Single-process cluster: every store, the coordinators and the ingest
//! router wired together over in-memory partitions.

use std::sync::Arc;
use tokio::task::JoinHandle;

use shardgraph_core::{
    CoreResult, MetaStore, Partition, PartitionAssignment, PartitionId, ShardgraphConfig,
    SnapshotCommitter, SnapshotId, StoreBackupClient, StoreId,
};
use shardgraph_store::{
    BackupAgent, MemoryPartition, PartitionWriteCoordinator, SnapshotSortQueue, StoreWriter,
    WorkerPool, WriterShutdown,
};

use crate::backup_manager::BackupManager;
use crate::ingest::IngestRouter;
use crate::rpc::CoordinatorService;
use crate::schema::{SchemaDdlExecutor, SchemaManager};
use crate::snapshot_manager::SnapshotManager;

/// One store of a [`LocalCluster`].
pub struct LocalStore {
    store_id: StoreId,
    partitions: Vec<Arc<MemoryPartition>>,
    coordinator: Arc<PartitionWriteCoordinator>,
    agent: Arc<BackupAgent>,
    shutdown: WriterShutdown,
    writer_task: Option<JoinHandle<SnapshotId>>,
}

impl LocalStore {
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn partitions(&self) -> &[Arc<MemoryPartition>] {
        &self.partitions
    }

    pub fn coordinator(&self) -> &Arc<PartitionWriteCoordinator> {
        &self.coordinator
    }

    pub fn agent(&self) -> &Arc<BackupAgent> {
        &self.agent
    }
}

pub struct LocalCluster {
    assignment: PartitionAssignment,
    snapshots: Arc<SnapshotManager>,
    router: Arc<IngestRouter>,
    schema: Arc<SchemaManager>,
    backups: Arc<BackupManager>,
    stores: Vec<LocalStore>,
}

impl LocalCluster {
    /// Builds and starts every component.
    ///
    /// # Errors
    ///
    /// Invalid layout, meta store failures, or a store that fails to
    /// recover.
    pub async fn start(config: &ShardgraphConfig, meta: Arc<dyn MetaStore>) -> CoreResult<Self> {
        let assignment =
            PartitionAssignment::new(config.cluster.store_count, config.cluster.partition_count)?;
        let queue_count = config.cluster.queue_count as usize;

        let snapshots = Arc::new(SnapshotManager::new(
            meta.clone(),
            assignment.store_count() as usize,
            queue_count,
            config.snapshot.listener_retry_interval(),
        ));
        snapshots.start().await?;

        let mut stores = Vec::with_capacity(assignment.store_count() as usize);
        let mut writers = Vec::with_capacity(assignment.store_count() as usize);
        for store_id in assignment.all_stores() {
            let partitions: Vec<Arc<MemoryPartition>> = assignment
                .partitions_of(store_id)
                .into_iter()
                .map(|id| Arc::new(MemoryPartition::new(id)))
                .collect();
            let coordinator = Arc::new(PartitionWriteCoordinator::new(
                store_id,
                partitions
                    .iter()
                    .map(|p| p.clone() as Arc<dyn Partition>)
                    .collect(),
                WorkerPool::new(store_id, config.store.worker_threads)?,
                config.store.write_retry_interval(),
            )?);

            let (writer, queue) = SnapshotSortQueue::channel(
                queue_count,
                config.sort_queue.capacity,
                config.sort_queue.wait(),
            )?;
            let store_writer = StoreWriter::start(
                coordinator.clone(),
                queue,
                snapshots.clone() as Arc<dyn SnapshotCommitter>,
                queue_count,
                config.store.commit_interval(),
            )
            .await?;
            let shutdown = store_writer.shutdown_handle();
            let writer_task = tokio::spawn(store_writer.run());

            writers.push(writer);
            stores.push(LocalStore {
                store_id,
                partitions,
                agent: Arc::new(BackupAgent::new(coordinator.clone(), config.backup.enabled)),
                coordinator,
                shutdown,
                writer_task: Some(writer_task),
            });
        }

        let router = Arc::new(IngestRouter::new(
            assignment,
            snapshots.clone(),
            writers,
            &snapshots.queue_offsets().await,
        )?);
        router.start_marker_worker();

        let schema = Arc::new(SchemaManager::new(
            meta.clone(),
            snapshots.clone(),
            router.clone(),
            Arc::new(SchemaDdlExecutor),
        ));
        schema.start().await?;

        let backups = Arc::new(BackupManager::new(
            meta,
            assignment,
            config.backup.enabled,
            snapshots.clone(),
            schema.clone(),
            stores
                .iter()
                .map(|store| store.agent.clone() as Arc<dyn StoreBackupClient>)
                .collect(),
        ));
        backups.start().await?;

        snapshots.start_increase_worker(config.snapshot.increase_interval());
        if config.backup.enabled {
            backups.start_gc_worker(config.backup.gc_interval());
        }

        tracing::info!(
            stores = assignment.store_count(),
            partitions = assignment.partition_count(),
            queues = queue_count,
            "Local cluster started"
        );
        Ok(Self {
            assignment,
            snapshots,
            router,
            schema,
            backups,
            stores,
        })
    }

    pub fn assignment(&self) -> PartitionAssignment {
        self.assignment
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn router(&self) -> &Arc<IngestRouter> {
        &self.router
    }

    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn stores(&self) -> &[LocalStore] {
        &self.stores
    }

    pub fn partition(&self, partition_id: PartitionId) -> Option<&Arc<MemoryPartition>> {
        let store_id = self.assignment.store_of(partition_id)?;
        self.stores
            .get(store_id.index())?
            .partitions
            .iter()
            .find(|p| p.id() == partition_id)
    }

    pub fn service(&self) -> CoordinatorService {
        CoordinatorService::new(
            self.snapshots.clone(),
            self.backups.clone(),
            self.schema.clone(),
        )
    }

    /// Stops background workers, lets every store drain what was already
    /// routed, then stops the snapshot manager. Returns each store's final
    /// complete snapshot id.
    pub async fn shutdown(mut self) -> Vec<SnapshotId> {
        self.backups.shutdown();
        self.router.close();

        let mut completed = Vec::with_capacity(self.stores.len());
        for store in &mut self.stores {
            let Some(task) = store.writer_task.take() else {
                continue;
            };
            match task.await {
                Ok(snapshot_id) => completed.push(snapshot_id),
                Err(e) => {
                    tracing::error!(store_id = %store.store_id, error = %e, "Store writer task failed");
                    completed.push(SnapshotId::ZERO);
                }
            }
        }

        self.snapshots.shutdown().await;
        tracing::info!("Local cluster shut down");
        completed
    }

    /// Stops every store writer without draining.
    pub async fn abort(mut self) {
        self.backups.shutdown();
        for store in &mut self.stores {
            store.shutdown.shutdown();
        }
        self.router.close();
        for store in &mut self.stores {
            if let Some(task) = store.writer_task.take() {
                let _ = task.await;
            }
        }
        self.snapshots.shutdown().await;
    }
}
