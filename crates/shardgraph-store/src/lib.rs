//! Store-side components of the shardgraph coordination layer: the
//! per-store sort queue, partition write coordination, the apply loop and
//! the backup agent.

pub mod backup_agent;
pub mod meta_store;
pub mod partition;
pub mod sort_queue;
pub mod worker_pool;
pub mod write_coordinator;
pub mod writer;

pub use backup_agent::BackupAgent;
pub use meta_store::{FileMetaStore, MemoryMetaStore};
pub use partition::{FaultPoint, MemoryBackupEngine, MemoryPartition};
pub use sort_queue::{Polled, SnapshotSortQueue, SortQueueWriter};
pub use worker_pool::WorkerPool;
pub use write_coordinator::PartitionWriteCoordinator;
pub use writer::{StoreWriter, WriterShutdown};
