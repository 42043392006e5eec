use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($name:ident, $inner:ty, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            /// Creates an identifier from its raw value.
            #[must_use]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_id!(
    SnapshotId,
    u64,
    "Cluster-wide monotonic snapshot identifier."
);
define_id!(QueueId, u32, "Identifier of one ingest queue.");
define_id!(StoreId, u32, "Identifier of one store process.");
define_id!(PartitionId, u32, "Identifier of one graph partition.");
define_id!(
    GlobalBackupId,
    i32,
    "Identifier of one cluster-wide backup. Never reused."
);
define_id!(
    PartitionBackupId,
    i32,
    "Backup identifier assigned by a partition's backup engine."
);
define_id!(ListenerId, u64, "Handle of a registered snapshot listener.");

impl SnapshotId {
    /// Snapshot every cluster starts from.
    pub const ZERO: Self = Self(0);

    /// The following snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the snapshot id reaches `u64::MAX`; wrapping would break
    /// watermark monotonicity.
    #[must_use]
    pub fn next(self) -> Self {
        Self(
            self.0
                .checked_add(1)
                .expect("snapshot id overflow: exceeded u64::MAX"),
        )
    }

    /// The preceding snapshot, saturating at zero.
    #[must_use]
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl QueueId {
    /// Index into per-queue vectors.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl StoreId {
    /// Index into per-store vectors.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_snapshot_id_ordering() {
        let s = SnapshotId::new(5);
        assert_eq!(s.next(), SnapshotId::new(6));
        assert_eq!(s.prev(), SnapshotId::new(4));
        assert_eq!(SnapshotId::ZERO.prev(), SnapshotId::ZERO);
        assert!(SnapshotId::new(9) > s);
    }

    #[test]
    fn test_ids_as_json_map_keys() {
        let mut map = BTreeMap::new();
        map.insert(PartitionId::new(2), PartitionBackupId::new(1));
        map.insert(PartitionId::new(10), PartitionBackupId::new(4));

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"2":1,"10":4}"#);

        let decoded: BTreeMap<PartitionId, PartitionBackupId> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_parse() {
        assert_eq!("17".parse::<SnapshotId>().unwrap(), SnapshotId::new(17));
        assert!("x".parse::<StoreId>().is_err());
    }
}
