//! Partition implementations.
//!
//! The [`Partition`](shardgraph_core::Partition) and
//! [`BackupEngine`](shardgraph_core::BackupEngine) traits live in
//! `shardgraph-core`; a physical engine plugs in behind them.

mod memory;

pub use memory::{AppliedOperation, FaultPoint, MemoryBackupEngine, MemoryPartition, RESTORED_IMAGE_FILE};
