//! Static partition ownership.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::{PartitionId, StoreId};

/// Assigns partitions to stores in contiguous, evenly sized blocks.
///
/// Partition `p` of `P` belongs to store `p * S / P` of `S`, so every store
/// owns at least one partition and blocks never interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    store_count: u32,
    partition_count: u32,
}

impl PartitionAssignment {
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` unless
    /// `partition_count >= store_count >= 1`.
    pub fn new(store_count: u32, partition_count: u32) -> CoreResult<Self> {
        if store_count == 0 {
            return Err(CoreError::ValidationError(
                "store_count must be > 0".to_string(),
            ));
        }
        if partition_count < store_count {
            return Err(CoreError::ValidationError(format!(
                "partition_count ({partition_count}) must be >= store_count ({store_count})"
            )));
        }
        Ok(Self {
            store_count,
            partition_count,
        })
    }

    #[must_use]
    pub fn store_count(&self) -> u32 {
        self.store_count
    }

    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Owning store of a partition, `None` for an unknown partition.
    #[must_use]
    pub fn store_of(&self, partition_id: PartitionId) -> Option<StoreId> {
        let p = u64::from(partition_id.get());
        if p >= u64::from(self.partition_count) {
            return None;
        }
        let store = p * u64::from(self.store_count) / u64::from(self.partition_count);
        Some(StoreId::new(store as u32))
    }

    /// Partitions owned by a store, ascending.
    #[must_use]
    pub fn partitions_of(&self, store_id: StoreId) -> Vec<PartitionId> {
        self.all_partitions()
            .filter(|p| self.store_of(*p) == Some(store_id))
            .collect()
    }

    pub fn all_partitions(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.partition_count).map(PartitionId::new)
    }

    pub fn all_stores(&self) -> impl Iterator<Item = StoreId> {
        (0..self.store_count).map(StoreId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_blocks() {
        let assignment = PartitionAssignment::new(2, 4).unwrap();
        assert_eq!(
            assignment.partitions_of(StoreId::new(0)),
            vec![PartitionId::new(0), PartitionId::new(1)]
        );
        assert_eq!(
            assignment.partitions_of(StoreId::new(1)),
            vec![PartitionId::new(2), PartitionId::new(3)]
        );
        assert_eq!(assignment.store_of(PartitionId::new(4)), None);
    }

    #[test]
    fn test_uneven_split_covers_every_store() {
        let assignment = PartitionAssignment::new(3, 7).unwrap();
        let mut total = 0;
        for store in assignment.all_stores() {
            let owned = assignment.partitions_of(store);
            assert!(!owned.is_empty());
            total += owned.len();
        }
        assert_eq!(total, 7);
    }

    #[test]
    fn test_rejects_more_stores_than_partitions() {
        assert!(PartitionAssignment::new(4, 2).is_err());
        assert!(PartitionAssignment::new(0, 2).is_err());
    }
}
