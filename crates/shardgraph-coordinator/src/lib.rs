//! Cluster-side coordination for shardgraph: snapshot watermarks, backups,
//! schema changes, ingest routing and a single-process cluster.

pub mod backup_manager;
pub mod ingest;
pub mod local;
pub mod rpc;
pub mod schema;
pub mod snapshot_manager;
pub mod telemetry;

pub use backup_manager::{
    BackupManager, RESTORE_GRAPH_DEF_FILE, RESTORE_QUERY_SNAPSHOT_ID_FILE,
    RESTORE_QUEUE_OFFSETS_FILE,
};
pub use ingest::IngestRouter;
pub use local::{LocalCluster, LocalStore};
pub use rpc::{CoordinatorService, RestoreRequest, RpcResponse};
pub use schema::{
    DdlExecutor, DdlRequest, DdlRequestBatch, GraphDef, GraphSchema, SchemaDdlExecutor,
    SchemaManager,
};
pub use snapshot_manager::{SnapshotManager, WriteSnapshotGuard};
pub use telemetry::init_tracing;
