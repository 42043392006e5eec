//! Core domain types and traits for the shardgraph coordination layer.

pub mod backup;
pub mod batch;
pub mod completion;
pub mod config;
pub mod error;
pub mod ids;
pub mod meta;
pub mod metrics;
pub mod snapshot;
pub mod topology;
pub mod traits;

pub use backup::{BackupInfo, StoreBackupId};
pub use batch::{Operation, OperationBatch, OperationKind, StoreDataBatch};
pub use completion::{Completion, CompletionReceiver};
pub use config::ShardgraphConfig;
pub use error::{CoreError, CoreResult};
pub use ids::{
    GlobalBackupId, ListenerId, PartitionBackupId, PartitionId, QueueId, SnapshotId, StoreId,
};
pub use snapshot::{CommitReport, QueueOffsets, SnapshotInfo};
pub use topology::PartitionAssignment;
pub use traits::{
    BackupEngine, BatchSink, MetaStore, Partition, SchemaSource, SnapshotCommitter,
    SnapshotListener, StoreBackupClient,
};
