use thiserror::Error;

use crate::ids::PartitionId;

/// Canonical error type for coordination operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"backup"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"vertex type"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Metadata or partition storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Validation error for a malformed or inconsistent request.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Backup was requested while backups are disabled.
    #[error("backup is disabled")]
    BackupDisabled,

    /// A single partition failed an operation.
    #[error("partition {partition_id} failed: {message}")]
    PartitionFailure {
        /// Partition that reported the failure.
        partition_id: PartitionId,
        /// Failure details reported by the partition engine.
        message: String,
    },

    /// The other side of a channel or worker pool has shut down.
    #[error("closed: {0}")]
    Closed(String),

    /// Waiting for a condition exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `PartitionFailure` variant.
    #[must_use]
    pub fn partition(partition_id: PartitionId, message: impl Into<String>) -> Self {
        Self::PartitionFailure {
            partition_id,
            message: message.into(),
        }
    }

    /// Stable, low-cardinality label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal { .. } => "internal",
            Self::IoError(_) => "io",
            Self::SerializationError(_) => "serialization",
            Self::DeserializationError(_) => "deserialization",
            Self::StorageError(_) => "storage",
            Self::ValidationError(_) => "validation",
            Self::BackupDisabled => "backup_disabled",
            Self::PartitionFailure { .. } => "partition",
            Self::Closed(_) => "closed",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() || err.is_syntax() || err.is_data() {
            Self::DeserializationError(err.to_string())
        } else {
            Self::SerializationError(err.to_string())
        }
    }
}

/// Convenient result alias for coordination operations.
pub type CoreResult<T> = Result<T, CoreError>;
