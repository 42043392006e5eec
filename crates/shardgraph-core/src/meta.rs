//! Well-known metadata paths and JSON helpers over [`MetaStore`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreResult;
use crate::traits::MetaStore;

pub const GLOBAL_BACKUP_ID_PATH: &str = "global_backup_id";
pub const BACKUP_INFO_PATH: &str = "backup_info";
pub const QUERY_SNAPSHOT_INFO_PATH: &str = "query_snapshot_info";
pub const WRITE_SNAPSHOT_ID_PATH: &str = "write_snapshot_id";
pub const QUEUE_OFFSETS_PATH: &str = "queue_offsets";
pub const GRAPH_DEF_PATH: &str = "graph_def";

/// Reads and decodes a JSON value, `None` if the path does not exist.
///
/// # Errors
///
/// Propagates store failures and malformed JSON.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn MetaStore,
    path: &str,
) -> CoreResult<Option<T>> {
    if !store.exists(path).await? {
        return Ok(None);
    }
    let bytes = store.read(path).await?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Encodes a value as JSON and writes it.
///
/// # Errors
///
/// Propagates encoding and store failures.
pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn MetaStore,
    path: &str,
    value: &T,
) -> CoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.write(path, &bytes).await
}
