//! [`MetaStore`] implementations: in-memory (tests, single-process demos) and
//! a local directory store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use shardgraph_core::{CoreError, CoreResult, MetaStore};

fn validate_path(path: &str) -> CoreResult<()> {
    if path.is_empty() {
        return Err(CoreError::ValidationError(
            "Meta path cannot be empty".to_string(),
        ));
    }
    if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(CoreError::ValidationError(format!(
            "Invalid meta path: {}",
            path
        )));
    }
    Ok(())
}

/// In-memory metadata store.
///
/// Supports injecting write failures so callers' persist-before-publish
/// paths can be exercised.
#[derive(Default)]
pub struct MemoryMetaStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a storage error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored path.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.values.read().keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn exists(&self, path: &str) -> CoreResult<bool> {
        validate_path(path)?;
        Ok(self.values.read().contains_key(path))
    }

    async fn read(&self, path: &str) -> CoreResult<Vec<u8>> {
        validate_path(path)?;
        self.values
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::not_found("MetaPath", path))
    }

    async fn write(&self, path: &str, value: &[u8]) -> CoreResult<()> {
        validate_path(path)?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::StorageError(format!(
                "Injected write failure: {}",
                path
            )));
        }
        self.values.write().insert(path.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        validate_path(path)?;
        self.values.write().remove(path);
        Ok(())
    }
}

/// Local filesystem metadata store
///
/// Each path is a file under the base directory. Writes go to a temporary
/// sibling first and are renamed into place, so readers never observe a
/// partially written value.
pub struct FileMetaStore {
    base_dir: PathBuf,
}

impl FileMetaStore {
    /// Create a new file metadata store
    ///
    /// Creates the base directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IoError` if directory creation fails
    pub async fn new(base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_dir.join(path)
    }
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn exists(&self, path: &str) -> CoreResult<bool> {
        validate_path(path)?;
        Ok(tokio::fs::try_exists(self.full_path(path)).await?)
    }

    async fn read(&self, path: &str) -> CoreResult<Vec<u8>> {
        validate_path(path)?;
        match tokio::fs::read(self.full_path(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found("MetaPath", path))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, value: &[u8]) -> CoreResult<()> {
        validate_path(path)?;
        let target = self.full_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &target).await?;

        tracing::trace!(path = %path, bytes = value.len(), "Wrote meta value");
        Ok(())
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        validate_path(path)?;
        match tokio::fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryMetaStore::new();

        assert!(!store.exists("queue_offsets").await.unwrap());
        store.write("queue_offsets", b"[1,2]").await.unwrap();
        assert!(store.exists("queue_offsets").await.unwrap());
        assert_eq!(store.read("queue_offsets").await.unwrap(), b"[1,2]");

        store.delete("queue_offsets").await.unwrap();
        store.delete("queue_offsets").await.unwrap();
        assert!(matches!(
            store.read("queue_offsets").await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures() {
        let store = MemoryMetaStore::new();
        store.fail_next_writes(1);

        assert!(store.write("a", b"1").await.is_err());
        assert!(!store.exists("a").await.unwrap());
        store.write("a", b"1").await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaStore::new(temp_dir.path()).await.unwrap();

        store.write("write_snapshot_id", b"17").await.unwrap();
        store.write("write_snapshot_id", b"18").await.unwrap();
        assert_eq!(store.read("write_snapshot_id").await.unwrap(), b"18");
        assert!(!temp_dir.path().join("write_snapshot_id.tmp").exists());

        store.delete("write_snapshot_id").await.unwrap();
        assert!(!store.exists("write_snapshot_id").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaStore::new(temp_dir.path()).await.unwrap();

        assert!(store.write("../outside", b"x").await.is_err());
        assert!(store.read("").await.is_err());
    }
}
