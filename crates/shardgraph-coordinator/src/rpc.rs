//! Coordinator RPC facade.
//!
//! Every method turns a coordination result into a serializable
//! [`RpcResponse`]; failures are reported in the response, never raised.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use shardgraph_core::metrics::{status_label, RPC_CALLS};
use shardgraph_core::{BackupInfo, CommitReport, CoreResult, GlobalBackupId, SnapshotId};

use crate::backup_manager::BackupManager;
use crate::schema::{DdlRequestBatch, GraphDef, SchemaManager};
use crate::snapshot_manager::SnapshotManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T> RpcResponse<T> {
    fn from_result(method: &'static str, result: CoreResult<T>) -> Self {
        RPC_CALLS
            .with_label_values(&[method, status_label(&result)])
            .inc();
        match result {
            Ok(payload) => Self {
                success: true,
                error_message: None,
                payload: Some(payload),
            },
            Err(e) => {
                tracing::warn!(method, error = %e, kind = e.kind(), "RPC call failed");
                Self {
                    success: false,
                    error_message: Some(e.to_string()),
                    payload: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub global_backup_id: GlobalBackupId,
    pub meta_restore_path: PathBuf,
    pub store_restore_path: PathBuf,
}

pub struct CoordinatorService {
    snapshots: Arc<SnapshotManager>,
    backups: Arc<BackupManager>,
    schema: Arc<SchemaManager>,
}

impl CoordinatorService {
    pub fn new(
        snapshots: Arc<SnapshotManager>,
        backups: Arc<BackupManager>,
        schema: Arc<SchemaManager>,
    ) -> Self {
        Self {
            snapshots,
            backups,
            schema,
        }
    }

    pub async fn create_backup(&self) -> RpcResponse<GlobalBackupId> {
        RpcResponse::from_result("create_backup", self.backups.create_new_backup().await)
    }

    pub async fn delete_backup(&self, global_backup_id: GlobalBackupId) -> RpcResponse<()> {
        RpcResponse::from_result(
            "delete_backup",
            self.backups.delete_backup(global_backup_id).await,
        )
    }

    pub async fn purge_old_backups(&self, keep_alive: usize) -> RpcResponse<()> {
        RpcResponse::from_result(
            "purge_old_backups",
            self.backups.purge_old_backups(keep_alive).await,
        )
    }

    pub async fn verify_backup(&self, global_backup_id: GlobalBackupId) -> RpcResponse<()> {
        RpcResponse::from_result(
            "verify_backup",
            self.backups.verify_backup(global_backup_id).await,
        )
    }

    pub async fn restore_from_backup(&self, request: RestoreRequest) -> RpcResponse<()> {
        let result = self
            .backups
            .restore_from_backup(
                request.global_backup_id,
                &request.meta_restore_path,
                &request.store_restore_path,
            )
            .await;
        RpcResponse::from_result("restore_from_backup", result)
    }

    /// Every retained backup, oldest first.
    pub async fn get_backup_info(&self) -> RpcResponse<Vec<BackupInfo>> {
        RpcResponse::from_result("get_backup_info", Ok(self.backups.backup_info_list().await))
    }

    pub async fn commit_snapshot_id(&self, report: CommitReport) -> RpcResponse<()> {
        RpcResponse::from_result(
            "commit_snapshot_id",
            self.snapshots.commit_snapshot_id(report).await,
        )
    }

    pub async fn submit_ddl(&self, batch: DdlRequestBatch) -> RpcResponse<SnapshotId> {
        RpcResponse::from_result("submit_ddl", self.schema.submit_ddl(batch).await)
    }

    pub async fn fetch_schema(&self) -> RpcResponse<GraphDef> {
        RpcResponse::from_result("fetch_schema", Ok(self.schema.graph_def().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgraph_core::CoreError;

    #[test]
    fn test_error_response_json() {
        let response: RpcResponse<GlobalBackupId> =
            RpcResponse::from_result("test", Err(CoreError::BackupDisabled));
        assert!(!response.success);
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"success":false,"error_message":"backup is disabled"}"#
        );
    }

    #[test]
    fn test_success_response_json() {
        let response = RpcResponse::from_result("test", Ok(GlobalBackupId::new(3)));
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"success":true,"payload":3}"#
        );
    }
}
