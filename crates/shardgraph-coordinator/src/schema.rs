//! Graph schema versions and DDL submission.
//!
//! A DDL batch is executed at a pinned write snapshot: the resulting schema
//! operations reach every partition tagged with that snapshot, so the new
//! schema becomes visible together with the first query snapshot that
//! includes it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use shardgraph_core::meta::{read_json, write_json, GRAPH_DEF_PATH};
use shardgraph_core::{
    BatchSink, CoreError, CoreResult, MetaStore, Operation, OperationBatch, OperationKind,
    QueueId, SchemaSource, SnapshotId,
};

use crate::snapshot_manager::SnapshotManager;

/// A versioned, serialized graph schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDef {
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// One schema change. `label` names the type, or for edge kinds
/// `edge_type:src_type->dst_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlRequest {
    pub kind: OperationKind,
    pub label: String,
}

impl DdlRequest {
    pub fn new(kind: OperationKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlRequestBatch {
    pub requests: Vec<DdlRequest>,
}

impl DdlRequestBatch {
    pub fn new(requests: Vec<DdlRequest>) -> Self {
        Self { requests }
    }
}

/// Turns a DDL batch into the next schema version and the operations every
/// partition must apply.
pub trait DdlExecutor: Send + Sync {
    fn execute(
        &self,
        current: &GraphDef,
        batch: &DdlRequestBatch,
    ) -> CoreResult<(GraphDef, Vec<Operation>)>;
}

/// Schema content understood by [`SchemaDdlExecutor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub vertex_types: BTreeSet<String>,
    pub edge_types: BTreeSet<String>,
    pub edge_kinds: BTreeSet<String>,
}

impl GraphSchema {
    pub fn from_graph_def(graph_def: &GraphDef) -> CoreResult<Self> {
        if graph_def.bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&graph_def.bytes)?)
    }

    fn parse_edge_kind(label: &str) -> CoreResult<(&str, &str, &str)> {
        let invalid = || {
            CoreError::ValidationError(format!(
                "Edge kind must look like edge_type:src->dst, got {}",
                label
            ))
        };
        let (edge_type, endpoints) = label.split_once(':').ok_or_else(invalid)?;
        let (src, dst) = endpoints.split_once("->").ok_or_else(invalid)?;
        Ok((edge_type, src, dst))
    }

    fn apply(&mut self, request: &DdlRequest) -> CoreResult<()> {
        let label = request.label.as_str();
        if label.is_empty() {
            return Err(CoreError::ValidationError(
                "DDL label cannot be empty".to_string(),
            ));
        }

        match request.kind {
            OperationKind::CreateVertexType => {
                if !self.vertex_types.insert(label.to_string()) {
                    return Err(CoreError::already_exists("VertexType", label));
                }
            }
            OperationKind::DropVertexType => {
                let referenced = self.edge_kinds.iter().any(|kind| {
                    Self::parse_edge_kind(kind)
                        .map(|(_, src, dst)| src == label || dst == label)
                        .unwrap_or(false)
                });
                if referenced {
                    return Err(CoreError::invalid_state(format!(
                        "vertex type {} is used by an edge kind",
                        label
                    )));
                }
                if !self.vertex_types.remove(label) {
                    return Err(CoreError::not_found("VertexType", label));
                }
            }
            OperationKind::CreateEdgeType => {
                if !self.edge_types.insert(label.to_string()) {
                    return Err(CoreError::already_exists("EdgeType", label));
                }
            }
            OperationKind::DropEdgeType => {
                let prefix = format!("{}:", label);
                if self.edge_kinds.iter().any(|kind| kind.starts_with(&prefix)) {
                    return Err(CoreError::invalid_state(format!(
                        "edge type {} still has edge kinds",
                        label
                    )));
                }
                if !self.edge_types.remove(label) {
                    return Err(CoreError::not_found("EdgeType", label));
                }
            }
            OperationKind::AddEdgeKind => {
                let (edge_type, src, dst) = Self::parse_edge_kind(label)?;
                if !self.edge_types.contains(edge_type) {
                    return Err(CoreError::not_found("EdgeType", edge_type));
                }
                for vertex_type in [src, dst] {
                    if !self.vertex_types.contains(vertex_type) {
                        return Err(CoreError::not_found("VertexType", vertex_type));
                    }
                }
                if !self.edge_kinds.insert(label.to_string()) {
                    return Err(CoreError::already_exists("EdgeKind", label));
                }
            }
            OperationKind::RemoveEdgeKind => {
                if !self.edge_kinds.remove(label) {
                    return Err(CoreError::not_found("EdgeKind", label));
                }
            }
            kind => {
                return Err(CoreError::ValidationError(format!(
                    "{:?} is not a DDL operation",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Executes DDL against a JSON-encoded [`GraphSchema`]. The batch is applied
/// atomically: any failing request rejects the whole batch.
#[derive(Debug, Default)]
pub struct SchemaDdlExecutor;

impl DdlExecutor for SchemaDdlExecutor {
    fn execute(
        &self,
        current: &GraphDef,
        batch: &DdlRequestBatch,
    ) -> CoreResult<(GraphDef, Vec<Operation>)> {
        let mut schema = GraphSchema::from_graph_def(current)?;
        let mut operations = Vec::with_capacity(batch.requests.len());
        for request in &batch.requests {
            schema.apply(request)?;
            operations.push(Operation::new(request.kind, request.label.as_bytes()));
        }

        let next = GraphDef {
            version: current.version + 1,
            bytes: serde_json::to_vec(&schema)?,
        };
        Ok((next, operations))
    }
}

pub struct SchemaManager {
    meta: Arc<dyn MetaStore>,
    snapshots: Arc<SnapshotManager>,
    sink: Arc<dyn BatchSink>,
    executor: Arc<dyn DdlExecutor>,
    /// Also serializes DDL submissions.
    graph_def: Mutex<SchemaState>,
}

struct SchemaState {
    current: GraphDef,
    /// `current` reached the partitions but its save failed.
    unsaved: bool,
}

impl SchemaManager {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        snapshots: Arc<SnapshotManager>,
        sink: Arc<dyn BatchSink>,
        executor: Arc<dyn DdlExecutor>,
    ) -> Self {
        Self {
            meta,
            snapshots,
            sink,
            executor,
            graph_def: Mutex::new(SchemaState {
                current: GraphDef {
                    version: 0,
                    bytes: Vec::new(),
                },
                unsaved: false,
            }),
        }
    }

    /// Loads the persisted schema, if any.
    pub async fn start(&self) -> CoreResult<()> {
        if let Some(graph_def) =
            read_json::<GraphDef>(self.meta.as_ref(), GRAPH_DEF_PATH).await?
        {
            tracing::info!(version = graph_def.version, "Loaded graph schema");
            self.graph_def.lock().await.current = graph_def;
        }
        Ok(())
    }

    pub async fn graph_def(&self) -> GraphDef {
        self.graph_def.lock().await.current.clone()
    }

    /// Applies a DDL batch at the current write snapshot and returns that
    /// snapshot. The schema is visible to readers once the query snapshot
    /// reaches it.
    ///
    /// # Errors
    ///
    /// A failed save after the operations were routed still applies the new
    /// schema in memory; the save is retried by the next submission, which
    /// fails until it succeeds.
    pub async fn submit_ddl(&self, batch: DdlRequestBatch) -> CoreResult<SnapshotId> {
        if batch.requests.is_empty() {
            return Err(CoreError::ValidationError(
                "DDL batch cannot be empty".to_string(),
            ));
        }
        if let Some(request) = batch.requests.iter().find(|r| !r.kind.is_ddl()) {
            return Err(CoreError::ValidationError(format!(
                "{:?} is not a DDL operation",
                request.kind
            )));
        }

        let mut state = self.graph_def.lock().await;
        if state.unsaved {
            write_json(self.meta.as_ref(), GRAPH_DEF_PATH, &state.current).await?;
            state.unsaved = false;
            tracing::info!(version = state.current.version, "Saved pending graph schema");
        }
        let pinned = self.snapshots.lock_write_snapshot().await?;
        let (next, operations) = self.executor.execute(&state.current, &batch)?;

        let snapshot_id = self
            .sink
            .write_to_all_partitions(QueueId::new(0), OperationBatch::new(operations))
            .await?;
        if snapshot_id != pinned.snapshot_id() {
            return Err(CoreError::internal(format!(
                "DDL written at snapshot {} while snapshot {} was pinned",
                snapshot_id,
                pinned.snapshot_id()
            )));
        }

        let saved = write_json(self.meta.as_ref(), GRAPH_DEF_PATH, &next).await;
        tracing::info!(
            version = next.version,
            snapshot_id = %snapshot_id,
            requests = batch.requests.len(),
            "Applied DDL batch"
        );
        state.current = next;
        if let Err(e) = saved {
            tracing::error!(
                version = state.current.version,
                error = %e,
                "Failed to save graph schema"
            );
            state.unsaved = true;
            return Err(e);
        }
        Ok(snapshot_id)
    }
}

#[async_trait]
impl SchemaSource for SchemaManager {
    async fn schema_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(self.graph_def.lock().await.current.bytes.clone())
    }
}
