//! Configuration management for shardgraph
//!
//! Layered loading with precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file named by `SHARDGRAPH_CONFIG`
//! 3. ./config/shardgraph.{toml,yaml,json}
//! 4. Hardcoded defaults (lowest priority)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ShardgraphConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub sort_queue: SortQueueConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub meta: MetaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ShardgraphConfig {
    /// Load configuration from all sources.
    ///
    /// Environment example: `SHARDGRAPH_CLUSTER__STORE_COUNT=4`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        if let Ok(config_path) = std::env::var("SHARDGRAPH_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/shardgraph").required(false))
            .add_source(
                Environment::with_prefix("SHARDGRAPH")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: ShardgraphConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, on top of the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ShardgraphConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            // Cluster layout
            .set_default("cluster.store_count", 2)?
            .set_default("cluster.partition_count", 4)?
            .set_default("cluster.queue_count", 2)?
            // Sort queue
            .set_default("sort_queue.capacity", 1024)?
            .set_default("sort_queue.wait_ms", 100)?
            // Store
            .set_default("store.worker_threads", 4)?
            .set_default("store.write_retry_ms", 1000)?
            .set_default("store.commit_interval_ms", 200)?
            // Snapshot
            .set_default("snapshot.increase_interval_ms", 1000)?
            .set_default("snapshot.listener_retry_ms", 500)?
            // Backup
            .set_default("backup.enabled", true)?
            .set_default("backup.gc_interval_ms", 60_000)?
            // Meta
            .set_default("meta.path", "./data/meta")?
            .set_default("meta.in_memory", false)?
            // Logging
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.store_count == 0 {
            return Err(ConfigError::Message(
                "cluster.store_count must be > 0".to_string(),
            ));
        }

        if self.cluster.partition_count < self.cluster.store_count {
            return Err(ConfigError::Message(
                "cluster.partition_count must be >= cluster.store_count".to_string(),
            ));
        }

        if self.cluster.queue_count == 0 {
            return Err(ConfigError::Message(
                "cluster.queue_count must be > 0".to_string(),
            ));
        }

        if self.sort_queue.capacity == 0 {
            return Err(ConfigError::Message(
                "sort_queue.capacity must be > 0".to_string(),
            ));
        }

        if self.sort_queue.wait_ms == 0 {
            return Err(ConfigError::Message(
                "sort_queue.wait_ms must be > 0".to_string(),
            ));
        }

        if self.store.worker_threads == 0 {
            return Err(ConfigError::Message(
                "store.worker_threads must be > 0".to_string(),
            ));
        }

        if self.snapshot.increase_interval_ms == 0 {
            return Err(ConfigError::Message(
                "snapshot.increase_interval_ms must be > 0".to_string(),
            ));
        }

        if self.backup.gc_interval_ms == 0 {
            return Err(ConfigError::Message(
                "backup.gc_interval_ms must be > 0".to_string(),
            ));
        }

        if !self.meta.in_memory && self.meta.path.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "meta.path is required unless meta.in_memory is set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Static cluster layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Number of store processes
    pub store_count: u32,

    /// Number of graph partitions across all stores
    pub partition_count: u32,

    /// Number of ingest queues
    pub queue_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            store_count: 2,
            partition_count: 4,
            queue_count: 2,
        }
    }
}

/// Per-store sort queue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SortQueueConfig {
    /// Bounded capacity of each queue channel
    pub capacity: usize,

    /// Maximum time offer/poll wait on a full/empty channel
    pub wait_ms: u64,
}

impl Default for SortQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            wait_ms: 100,
        }
    }
}

impl SortQueueConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Store write path
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Size of the per-store worker pool shared by writes and backups
    pub worker_threads: usize,

    /// Delay before retrying a failed partition write
    pub write_retry_ms: u64,

    /// Minimum interval between commit reports
    pub commit_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            write_retry_ms: 1000,
            commit_interval_ms: 200,
        }
    }
}

impl StoreConfig {
    pub fn write_retry_interval(&self) -> Duration {
        Duration::from_millis(self.write_retry_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}

/// Snapshot watermark coordination
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    /// Period of write snapshot increases
    pub increase_interval_ms: u64,

    /// Delay before redelivering an advance to a failing listener
    pub listener_retry_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            increase_interval_ms: 1000,
            listener_retry_ms: 500,
        }
    }
}

impl SnapshotConfig {
    pub fn increase_interval(&self) -> Duration {
        Duration::from_millis(self.increase_interval_ms)
    }

    pub fn listener_retry_interval(&self) -> Duration {
        Duration::from_millis(self.listener_retry_ms)
    }
}

/// Backup orchestration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    /// Reject every backup operation when false
    pub enabled: bool,

    /// Period of the garbage collection pass over partition backups
    pub gc_interval_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gc_interval_ms: 60_000,
        }
    }
}

impl BackupConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// Metadata store location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaConfig {
    /// Directory of the file-backed metadata store
    pub path: PathBuf,

    /// Keep metadata in memory only (tests, demos)
    pub in_memory: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/meta"),
            in_memory: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error, or a full `EnvFilter` directive
    pub level: String,

    /// json or pretty
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = ShardgraphConfig::default();

        assert_eq!(config.cluster.store_count, 2);
        assert_eq!(config.cluster.partition_count, 4);
        assert_eq!(config.cluster.queue_count, 2);
        assert_eq!(config.sort_queue.wait().as_millis(), 100);
        assert_eq!(config.store.write_retry_interval().as_secs(), 1);
        assert!(config.backup.enabled);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ShardgraphConfig::default();

        config.cluster.partition_count = 1;
        assert!(config.validate().is_err());

        config.cluster.partition_count = 4;
        assert!(config.validate().is_ok());

        config.sort_queue.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardgraph.toml");
        std::fs::write(
            &path,
            "[cluster]\nstore_count = 3\npartition_count = 6\n\n[backup]\nenabled = false\n",
        )
        .unwrap();

        let config = ShardgraphConfig::from_file(&path).unwrap();
        assert_eq!(config.cluster.store_count, 3);
        assert_eq!(config.cluster.partition_count, 6);
        assert_eq!(config.cluster.queue_count, 2);
        assert!(!config.backup.enabled);
        assert_eq!(config.sort_queue.capacity, 1024);
    }
}
