//! Watermark state shared between stores and the snapshot coordinator.

use serde::{Deserialize, Serialize};

use crate::ids::{QueueId, SnapshotId, StoreId};

/// Durable coordinator state: the visible snapshot and the newest schema
/// change it includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub query_snapshot_id: SnapshotId,
    pub ddl_snapshot_id: SnapshotId,
}

impl SnapshotInfo {
    #[must_use]
    pub fn new(query_snapshot_id: SnapshotId, ddl_snapshot_id: SnapshotId) -> Self {
        Self {
            query_snapshot_id,
            ddl_snapshot_id,
        }
    }
}

/// Per-queue consumption offsets. `-1` means nothing has been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueOffsets(Vec<i64>);

impl QueueOffsets {
    /// Offset value of a queue nothing has been consumed from.
    pub const UNCONSUMED: i64 = -1;

    /// Offsets for `queue_count` untouched queues.
    #[must_use]
    pub fn new(queue_count: usize) -> Self {
        Self(vec![Self::UNCONSUMED; queue_count])
    }

    #[must_use]
    pub fn from_vec(offsets: Vec<i64>) -> Self {
        Self(offsets)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, queue_id: QueueId) -> Option<i64> {
        self.0.get(queue_id.index()).copied()
    }

    /// Records the offset of the latest consumed entry of `queue_id`.
    /// Out-of-range queue ids are ignored.
    pub fn set(&mut self, queue_id: QueueId, offset: i64) {
        if let Some(slot) = self.0.get_mut(queue_id.index()) {
            *slot = offset;
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// Per-queue minimum of two offset vectors of equal length.
    #[must_use]
    pub fn min_with(&self, other: &Self) -> Self {
        Self(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (*a).min(*b))
                .collect(),
        )
    }

    /// Per-queue maximum of two offset vectors of equal length.
    #[must_use]
    pub fn max_with(&self, other: &Self) -> Self {
        Self(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (*a).max(*b))
                .collect(),
        )
    }
}

/// Sent by a store once it has durably applied everything through
/// `snapshot_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub store_id: StoreId,
    pub snapshot_id: SnapshotId,
    pub ddl_snapshot_id: SnapshotId,
    pub queue_offsets: QueueOffsets,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_offsets_min_max() {
        let a = QueueOffsets::from_vec(vec![3, 7, -1]);
        let b = QueueOffsets::from_vec(vec![5, 2, 0]);
        assert_eq!(a.min_with(&b).as_slice(), &[3, 2, -1]);
        assert_eq!(a.max_with(&b).as_slice(), &[5, 7, 0]);
    }

    #[test]
    fn test_queue_offsets_set() {
        let mut offsets = QueueOffsets::new(2);
        assert_eq!(offsets.get(QueueId::new(1)), Some(-1));
        offsets.set(QueueId::new(1), 42);
        offsets.set(QueueId::new(9), 1);
        assert_eq!(offsets.as_slice(), &[-1, 42]);
    }

    #[test]
    fn test_snapshot_info_json() {
        let info = SnapshotInfo::new(SnapshotId::new(12), SnapshotId::new(4));
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"query_snapshot_id":12,"ddl_snapshot_id":4}"#);
    }
}
