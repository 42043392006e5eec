//! Mutation batches flowing from ingest queues into partitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{PartitionId, QueueId, SnapshotId};

/// Kind of a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    OverwriteVertex,
    UpdateVertex,
    DeleteVertex,
    OverwriteEdge,
    UpdateEdge,
    DeleteEdge,
    CreateVertexType,
    DropVertexType,
    CreateEdgeType,
    DropEdgeType,
    AddEdgeKind,
    RemoveEdgeKind,
    /// Carries no data; only advances a queue's snapshot.
    Marker,
}

impl OperationKind {
    /// Whether this operation changes the graph schema.
    #[must_use]
    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            Self::CreateVertexType
                | Self::DropVertexType
                | Self::CreateEdgeType
                | Self::DropEdgeType
                | Self::AddEdgeKind
                | Self::RemoveEdgeKind
        )
    }
}

/// One mutation with an opaque, engine-defined payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Operation {
    #[must_use]
    pub fn new(kind: OperationKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn marker() -> Self {
        Self::new(OperationKind::Marker, Vec::new())
    }
}

/// Ordered operations targeting one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub operations: Vec<Operation>,
}

impl OperationBatch {
    #[must_use]
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether any operation in the batch is a schema change.
    #[must_use]
    pub fn has_ddl(&self) -> bool {
        self.operations.iter().any(|op| op.kind.is_ddl())
    }
}

/// The unit ingested into a store's sort queue.
///
/// Producers emit batches of one queue in non-decreasing `snapshot_id` order;
/// `offset` is the producer's position in that queue and is what commit
/// reports carry back for ingest resumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDataBatch {
    pub snapshot_id: SnapshotId,
    pub queue_id: QueueId,
    pub offset: i64,
    #[serde(default)]
    pub partition_batches: BTreeMap<PartitionId, OperationBatch>,
}

impl StoreDataBatch {
    #[must_use]
    pub fn new(snapshot_id: SnapshotId, queue_id: QueueId, offset: i64) -> Self {
        Self {
            snapshot_id,
            queue_id,
            offset,
            partition_batches: BTreeMap::new(),
        }
    }

    /// Builder-style helper adding one partition's operations.
    #[must_use]
    pub fn with_partition(mut self, partition_id: PartitionId, batch: OperationBatch) -> Self {
        self.partition_batches.insert(partition_id, batch);
        self
    }

    /// Total operations across partitions.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.partition_batches.values().map(OperationBatch::len).sum()
    }

    /// A batch that only advances its queue's snapshot.
    #[must_use]
    pub fn is_marker(&self) -> bool {
        self.partition_batches
            .values()
            .all(|batch| batch.operations.iter().all(|op| op.kind == OperationKind::Marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_classification() {
        assert!(OperationKind::CreateVertexType.is_ddl());
        assert!(OperationKind::RemoveEdgeKind.is_ddl());
        assert!(!OperationKind::OverwriteVertex.is_ddl());
        assert!(!OperationKind::Marker.is_ddl());

        let batch = OperationBatch::new(vec![
            Operation::new(OperationKind::OverwriteVertex, b"v1".to_vec()),
            Operation::new(OperationKind::CreateEdgeType, b"knows".to_vec()),
        ]);
        assert!(batch.has_ddl());
    }

    #[test]
    fn test_marker_batches() {
        let empty = StoreDataBatch::new(SnapshotId::new(3), QueueId::new(0), 0);
        assert!(empty.is_marker());

        let data = empty.clone().with_partition(
            PartitionId::new(1),
            OperationBatch::new(vec![Operation::new(OperationKind::DeleteEdge, vec![1])]),
        );
        assert!(!data.is_marker());
        assert_eq!(data.operation_count(), 1);
    }
}
