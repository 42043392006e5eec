//! Cluster snapshot watermarks.
//!
//! The write snapshot id is what ingestion tags new batches with. Stores
//! report the snapshot they have completely applied; once every store has
//! reported, the query snapshot advances to the minimum of their reports.
//! Every advance is persisted before it becomes visible, then broadcast to
//! watchers and delivered, in order and at least once, to each listener.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use shardgraph_core::meta::{
    read_json, write_json, QUERY_SNAPSHOT_INFO_PATH, QUEUE_OFFSETS_PATH, WRITE_SNAPSHOT_ID_PATH,
};
use shardgraph_core::metrics::{COMMIT_REPORTS, QUERY_SNAPSHOT_ID, WRITE_SNAPSHOT_ID};
use shardgraph_core::{
    CommitReport, CoreError, CoreResult, ListenerId, MetaStore, QueueOffsets, SnapshotCommitter,
    SnapshotId, SnapshotInfo, SnapshotListener,
};

type Advance = (SnapshotId, Option<SnapshotId>);

struct ListenerHandle {
    sender: mpsc::UnboundedSender<Advance>,
    removed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct SnapshotState {
    started: bool,
    write_snapshot_id: SnapshotId,
    query: SnapshotInfo,
    /// Newest DDL snapshot already handed to listeners.
    published_ddl: SnapshotId,
    reports: Vec<Option<CommitReport>>,
    queue_offsets: QueueOffsets,
    listeners: BTreeMap<ListenerId, ListenerHandle>,
}

/// Holds the write snapshot id fixed until dropped.
pub struct WriteSnapshotGuard {
    snapshot_id: SnapshotId,
    _guard: OwnedMutexGuard<()>,
}

impl WriteSnapshotGuard {
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }
}

pub struct SnapshotManager {
    meta: Arc<dyn MetaStore>,
    store_count: usize,
    queue_count: usize,
    listener_retry: Duration,
    state: Mutex<SnapshotState>,
    write_lock: Arc<Mutex<()>>,
    write_tx: watch::Sender<SnapshotId>,
    info_tx: watch::Sender<SnapshotInfo>,
    next_listener_id: AtomicU64,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotManager {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        store_count: usize,
        queue_count: usize,
        listener_retry: Duration,
    ) -> Self {
        let (write_tx, _) = watch::channel(SnapshotId::ZERO);
        let (info_tx, _) = watch::channel(SnapshotInfo::default());
        Self {
            meta,
            store_count,
            queue_count,
            listener_retry,
            state: Mutex::new(SnapshotState {
                started: false,
                write_snapshot_id: SnapshotId::ZERO,
                query: SnapshotInfo::default(),
                published_ddl: SnapshotId::ZERO,
                reports: vec![None; store_count],
                queue_offsets: QueueOffsets::new(queue_count),
                listeners: BTreeMap::new(),
            }),
            write_lock: Arc::new(Mutex::new(())),
            write_tx,
            info_tx,
            next_listener_id: AtomicU64::new(1),
            worker: parking_lot::Mutex::new(None),
        }
    }

    /// Loads the watermarks, or bootstraps a fresh cluster at snapshot 0.
    ///
    /// # Errors
    ///
    /// Meta store failures, or persisted offsets for a different number of
    /// queues.
    pub async fn start(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }

        let query = match read_json::<SnapshotInfo>(self.meta.as_ref(), QUERY_SNAPSHOT_INFO_PATH)
            .await?
        {
            Some(info) => info,
            None => {
                let info = SnapshotInfo::default();
                write_json(self.meta.as_ref(), QUERY_SNAPSHOT_INFO_PATH, &info).await?;
                info
            }
        };

        let queue_offsets =
            match read_json::<QueueOffsets>(self.meta.as_ref(), QUEUE_OFFSETS_PATH).await? {
                Some(offsets) => offsets,
                None => {
                    let offsets = QueueOffsets::new(self.queue_count);
                    write_json(self.meta.as_ref(), QUEUE_OFFSETS_PATH, &offsets).await?;
                    offsets
                }
            };
        if queue_offsets.len() != self.queue_count {
            return Err(CoreError::ValidationError(format!(
                "Persisted queue offsets cover {} queues, cluster has {}",
                queue_offsets.len(),
                self.queue_count
            )));
        }

        let persisted_write =
            read_json::<SnapshotId>(self.meta.as_ref(), WRITE_SNAPSHOT_ID_PATH).await?;
        // Batches at or below the query snapshot are skipped by recovered
        // stores, so ingest must start past it.
        let write_snapshot_id = persisted_write
            .unwrap_or(SnapshotId::ZERO)
            .max(query.query_snapshot_id.next());
        if persisted_write != Some(write_snapshot_id) {
            write_json(self.meta.as_ref(), WRITE_SNAPSHOT_ID_PATH, &write_snapshot_id).await?;
        }

        state.started = true;
        state.write_snapshot_id = write_snapshot_id;
        state.query = query;
        state.published_ddl = query.ddl_snapshot_id;
        state.queue_offsets = queue_offsets;

        WRITE_SNAPSHOT_ID.set(write_snapshot_id.get() as i64);
        QUERY_SNAPSHOT_ID.set(query.query_snapshot_id.get() as i64);
        self.write_tx.send_replace(write_snapshot_id);
        self.info_tx.send_replace(query);

        tracing::info!(
            write_snapshot_id = %write_snapshot_id,
            query_snapshot_id = %query.query_snapshot_id,
            ddl_snapshot_id = %query.ddl_snapshot_id,
            "Snapshot manager started"
        );
        Ok(())
    }

    fn ensure_started(state: &SnapshotState) -> CoreResult<()> {
        if state.started {
            Ok(())
        } else {
            Err(CoreError::invalid_state("snapshot manager not started"))
        }
    }

    /// Issues the next write snapshot id. It is persisted before anyone can
    /// observe it.
    pub async fn increase_write_snapshot_id(&self) -> CoreResult<SnapshotId> {
        let _write = self.write_lock.lock().await;
        let mut state = self.state.lock().await;
        Self::ensure_started(&state)?;

        let next = state.write_snapshot_id.next();
        write_json(self.meta.as_ref(), WRITE_SNAPSHOT_ID_PATH, &next).await?;
        state.write_snapshot_id = next;

        WRITE_SNAPSHOT_ID.set(next.get() as i64);
        self.write_tx.send_replace(next);
        tracing::trace!(write_snapshot_id = %next, "Increased write snapshot id");
        Ok(next)
    }

    /// Pins the current write snapshot id until the guard is dropped.
    pub async fn lock_write_snapshot(&self) -> CoreResult<WriteSnapshotGuard> {
        let guard = self.write_lock.clone().lock_owned().await;
        let state = self.state.lock().await;
        Self::ensure_started(&state)?;
        Ok(WriteSnapshotGuard {
            snapshot_id: state.write_snapshot_id,
            _guard: guard,
        })
    }

    /// Increases the write snapshot id every `interval`.
    pub fn start_increase_worker(self: &Arc<Self>, interval: Duration) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::warn!("Write snapshot worker already running");
            return;
        }

        let manager = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.increase_write_snapshot_id().await {
                    tracing::error!(error = %e, "Failed to increase write snapshot id");
                }
            }
        }));
        tracing::info!("Write snapshot worker started (interval: {:?})", interval);
    }

    /// Handles a store's commit report.
    ///
    /// Stale reports and reports that cannot be valid are logged and ignored.
    ///
    /// # Errors
    ///
    /// `ValidationError` for offsets of the wrong length; meta store failures
    /// while persisting an advance (the watermark is left unchanged).
    pub async fn commit_snapshot_id(&self, report: CommitReport) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        Self::ensure_started(&state)?;

        let store_idx = report.store_id.index();
        if store_idx >= self.store_count {
            tracing::warn!(
                store_id = %report.store_id,
                store_count = self.store_count,
                "Ignoring commit report from unknown store"
            );
            COMMIT_REPORTS.with_label_values(&["rejected"]).inc();
            return Ok(());
        }
        if report.queue_offsets.len() != self.queue_count {
            COMMIT_REPORTS.with_label_values(&["rejected"]).inc();
            return Err(CoreError::ValidationError(format!(
                "Commit report carries {} queue offsets, cluster has {} queues",
                report.queue_offsets.len(),
                self.queue_count
            )));
        }
        if let Some(previous) = &state.reports[store_idx] {
            if report.snapshot_id == previous.snapshot_id {
                // A repeated report retries an advance whose persist failed.
                tracing::debug!(
                    store_id = %report.store_id,
                    snapshot_id = %report.snapshot_id,
                    "Repeated commit report"
                );
                COMMIT_REPORTS.with_label_values(&["stale"]).inc();
                return self.try_advance(&mut state).await;
            }
            if report.snapshot_id < previous.snapshot_id {
                tracing::debug!(
                    store_id = %report.store_id,
                    snapshot_id = %report.snapshot_id,
                    previous_snapshot_id = %previous.snapshot_id,
                    "Ignoring stale commit report"
                );
                COMMIT_REPORTS.with_label_values(&["stale"]).inc();
                return Ok(());
            }
        }
        if report.snapshot_id > state.write_snapshot_id {
            tracing::warn!(
                store_id = %report.store_id,
                snapshot_id = %report.snapshot_id,
                write_snapshot_id = %state.write_snapshot_id,
                "Ignoring commit report ahead of the write snapshot"
            );
            COMMIT_REPORTS.with_label_values(&["rejected"]).inc();
            return Ok(());
        }

        COMMIT_REPORTS.with_label_values(&["accepted"]).inc();
        state.reports[store_idx] = Some(report);
        self.try_advance(&mut state).await
    }

    async fn try_advance(&self, state: &mut SnapshotState) -> CoreResult<()> {
        let Some(reports) = state
            .reports
            .iter()
            .map(Option::as_ref)
            .collect::<Option<Vec<&CommitReport>>>()
        else {
            return Ok(());
        };
        let Some(candidate) = reports.iter().map(|r| r.snapshot_id).min() else {
            return Ok(());
        };
        if candidate <= state.query.query_snapshot_id {
            return Ok(());
        }

        let ddl = reports
            .iter()
            .map(|r| r.ddl_snapshot_id)
            .min()
            .unwrap_or(SnapshotId::ZERO)
            .min(candidate)
            .max(state.query.ddl_snapshot_id);
        let queue_offsets = reports
            .iter()
            .map(|r| r.queue_offsets.clone())
            .reduce(|a, b| a.min_with(&b))
            .unwrap_or_else(|| QueueOffsets::new(self.queue_count))
            .max_with(&state.queue_offsets);
        let info = SnapshotInfo::new(candidate, ddl);

        let persisted = async {
            write_json(self.meta.as_ref(), QUEUE_OFFSETS_PATH, &queue_offsets).await?;
            write_json(self.meta.as_ref(), QUERY_SNAPSHOT_INFO_PATH, &info).await
        }
        .await;
        if let Err(e) = persisted {
            tracing::error!(
                query_snapshot_id = %candidate,
                error = %e,
                "Failed to persist query snapshot advance"
            );
            COMMIT_REPORTS.with_label_values(&["persist_failed"]).inc();
            return Err(e);
        }

        state.query = info;
        state.queue_offsets = queue_offsets;
        let new_ddl = if ddl > state.published_ddl {
            state.published_ddl = ddl;
            Some(ddl)
        } else {
            None
        };

        QUERY_SNAPSHOT_ID.set(candidate.get() as i64);
        COMMIT_REPORTS.with_label_values(&["advanced"]).inc();
        self.info_tx.send_replace(info);
        for handle in state.listeners.values() {
            // A closed channel means the listener is being removed.
            let _ = handle.sender.send((candidate, new_ddl));
        }

        tracing::info!(
            query_snapshot_id = %candidate,
            ddl_snapshot_id = %ddl,
            "Query snapshot advanced"
        );
        Ok(())
    }

    /// Registers a listener. It first receives the current query snapshot,
    /// then every advance in order.
    pub async fn add_listener(&self, listener: Arc<dyn SnapshotListener>) -> ListenerId {
        let id = ListenerId::new(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();
        let removed = Arc::new(AtomicBool::new(false));

        let mut state = self.state.lock().await;
        let current = state.query;
        let ddl = (current.ddl_snapshot_id > SnapshotId::ZERO).then_some(current.ddl_snapshot_id);
        let _ = sender.send((current.query_snapshot_id, ddl));

        let task = tokio::spawn(dispatch_to_listener(
            id,
            listener,
            receiver,
            removed.clone(),
            self.listener_retry,
        ));
        state.listeners.insert(
            id,
            ListenerHandle {
                sender,
                removed,
                task,
            },
        );
        tracing::debug!(listener_id = %id, "Added snapshot listener");
        id
    }

    /// Stops delivery to a listener. Returns whether it was registered.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self.state.lock().await.listeners.remove(&id);
        match removed {
            Some(handle) => {
                handle.removed.store(true, Ordering::SeqCst);
                tracing::debug!(listener_id = %id, "Removed snapshot listener");
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SnapshotInfo> {
        self.info_tx.subscribe()
    }

    pub fn subscribe_write_snapshot(&self) -> watch::Receiver<SnapshotId> {
        self.write_tx.subscribe()
    }

    /// Waits until the query snapshot reaches `snapshot_id`.
    ///
    /// # Errors
    ///
    /// `Timeout` if it does not within `timeout`.
    pub async fn wait_for_query_snapshot(
        &self,
        snapshot_id: SnapshotId,
        timeout: Duration,
    ) -> CoreResult<SnapshotInfo> {
        let mut receiver = self.info_tx.subscribe();
        let result = match tokio::time::timeout(
            timeout,
            receiver.wait_for(|info| info.query_snapshot_id >= snapshot_id),
        )
        .await
        {
            Ok(Ok(info)) => Ok(*info),
            Ok(Err(_)) => Err(CoreError::Closed("snapshot manager dropped".to_string())),
            Err(_) => Err(CoreError::Timeout(format!(
                "query snapshot did not reach {} within {:?}",
                snapshot_id, timeout
            ))),
        };
        result
    }

    pub async fn write_snapshot_id(&self) -> SnapshotId {
        self.state.lock().await.write_snapshot_id
    }

    pub async fn query_snapshot_info(&self) -> SnapshotInfo {
        self.state.lock().await.query
    }

    pub async fn queue_offsets(&self) -> QueueOffsets {
        self.state.lock().await.queue_offsets.clone()
    }

    /// Query snapshot and the queue offsets persisted with it, read together.
    pub async fn query_snapshot_with_offsets(&self) -> (SnapshotId, QueueOffsets) {
        let state = self.state.lock().await;
        (state.query.query_snapshot_id, state.queue_offsets.clone())
    }

    /// Stops the increase worker and every listener dispatch task.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            tracing::info!("Write snapshot worker shut down");
        }
        let listeners = std::mem::take(&mut self.state.lock().await.listeners);
        for (_, handle) in listeners {
            handle.removed.store(true, Ordering::SeqCst);
            handle.task.abort();
        }
    }
}

async fn dispatch_to_listener(
    id: ListenerId,
    listener: Arc<dyn SnapshotListener>,
    mut receiver: mpsc::UnboundedReceiver<Advance>,
    removed: Arc<AtomicBool>,
    retry: Duration,
) {
    while let Some((query_snapshot_id, ddl_snapshot_id)) = receiver.recv().await {
        loop {
            if removed.load(Ordering::SeqCst) {
                return;
            }
            match listener
                .on_snapshot_advanced(query_snapshot_id, ddl_snapshot_id)
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        listener_id = %id,
                        query_snapshot_id = %query_snapshot_id,
                        error = %e,
                        "Snapshot listener failed, will redeliver"
                    );
                    tokio::time::sleep(retry).await;
                }
            }
        }
    }
}

#[async_trait]
impl SnapshotCommitter for SnapshotManager {
    async fn commit_snapshot_id(&self, report: CommitReport) -> CoreResult<()> {
        SnapshotManager::commit_snapshot_id(self, report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgraph_core::StoreId;
    use shardgraph_store::MemoryMetaStore;

    fn report(store: u32, snapshot: u64, ddl: u64, offsets: Vec<i64>) -> CommitReport {
        CommitReport {
            store_id: StoreId::new(store),
            snapshot_id: SnapshotId::new(snapshot),
            ddl_snapshot_id: SnapshotId::new(ddl),
            queue_offsets: QueueOffsets::from_vec(offsets),
        }
    }

    async fn started(meta: Arc<MemoryMetaStore>) -> SnapshotManager {
        let manager = SnapshotManager::new(meta, 2, 2, Duration::from_millis(5));
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_bootstrap_persists_all_paths() {
        let meta = Arc::new(MemoryMetaStore::new());
        let _manager = started(meta.clone()).await;

        assert_eq!(
            meta.paths(),
            vec![
                QUERY_SNAPSHOT_INFO_PATH.to_string(),
                QUEUE_OFFSETS_PATH.to_string(),
                WRITE_SNAPSHOT_ID_PATH.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_query_snapshot_is_minimum_of_stores() {
        let meta = Arc::new(MemoryMetaStore::new());
        let manager = started(meta.clone()).await;
        for _ in 0..10 {
            manager.increase_write_snapshot_id().await.unwrap();
        }

        manager.commit_snapshot_id(report(0, 10, 0, vec![4, 4])).await.unwrap();
        assert_eq!(
            manager.query_snapshot_info().await.query_snapshot_id,
            SnapshotId::ZERO
        );

        manager.commit_snapshot_id(report(1, 8, 0, vec![3, 5])).await.unwrap();
        assert_eq!(
            manager.query_snapshot_info().await.query_snapshot_id,
            SnapshotId::new(8)
        );
        assert_eq!(manager.queue_offsets().await.as_slice(), &[3, 4]);

        let persisted: SnapshotInfo = read_json(meta.as_ref(), QUERY_SNAPSHOT_INFO_PATH)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.query_snapshot_id, SnapshotId::new(8));
    }

    #[tokio::test]
    async fn test_increase_write_snapshot_persists() {
        let meta = Arc::new(MemoryMetaStore::new());
        let manager = started(meta.clone()).await;

        assert_eq!(manager.write_snapshot_id().await, SnapshotId::new(1));
        assert_eq!(
            manager.increase_write_snapshot_id().await.unwrap(),
            SnapshotId::new(2)
        );
        meta.fail_next_writes(1);
        assert!(manager.increase_write_snapshot_id().await.is_err());
        assert_eq!(manager.write_snapshot_id().await, SnapshotId::new(2));

        let restarted = started(meta).await;
        assert_eq!(restarted.write_snapshot_id().await, SnapshotId::new(2));
    }

    #[tokio::test]
    async fn test_rejects_reports_ahead_of_write_snapshot() {
        let manager = started(Arc::new(MemoryMetaStore::new())).await;

        manager.commit_snapshot_id(report(0, 3, 0, vec![0, 0])).await.unwrap();
        manager.commit_snapshot_id(report(1, 3, 0, vec![0, 0])).await.unwrap();
        assert_eq!(
            manager.query_snapshot_info().await.query_snapshot_id,
            SnapshotId::ZERO
        );
    }

    #[tokio::test]
    async fn test_locked_write_snapshot_blocks_increase() {
        let manager = Arc::new(started(Arc::new(MemoryMetaStore::new())).await);
        let guard = manager.lock_write_snapshot().await.unwrap();
        assert_eq!(guard.snapshot_id(), SnapshotId::new(1));

        let increaser = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.increase_write_snapshot_id().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!increaser.is_finished());
        assert_eq!(manager.write_snapshot_id().await, SnapshotId::new(1));

        drop(guard);
        assert_eq!(increaser.await.unwrap().unwrap(), SnapshotId::new(2));
    }

    #[tokio::test]
    async fn test_repeated_report_retries_failed_advance() {
        let meta = Arc::new(MemoryMetaStore::new());
        let manager = started(meta.clone()).await;
        for _ in 0..5 {
            manager.increase_write_snapshot_id().await.unwrap();
        }

        manager.commit_snapshot_id(report(0, 5, 0, vec![2, 2])).await.unwrap();
        meta.fail_next_writes(1);
        assert!(manager
            .commit_snapshot_id(report(1, 5, 0, vec![1, 3]))
            .await
            .is_err());
        assert_eq!(
            manager.query_snapshot_info().await.query_snapshot_id,
            SnapshotId::ZERO
        );

        manager.commit_snapshot_id(report(1, 5, 0, vec![1, 3])).await.unwrap();
        assert_eq!(
            manager.query_snapshot_info().await.query_snapshot_id,
            SnapshotId::new(5)
        );
        assert_eq!(manager.queue_offsets().await.as_slice(), &[1, 2]);
        let persisted: SnapshotInfo = read_json(meta.as_ref(), QUERY_SNAPSHOT_INFO_PATH)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.query_snapshot_id, SnapshotId::new(5));
    }

    #[tokio::test]
    async fn test_wait_for_query_snapshot_times_out() {
        let manager = started(Arc::new(MemoryMetaStore::new())).await;
        assert!(matches!(
            manager
                .wait_for_query_snapshot(SnapshotId::new(1), Duration::from_millis(10))
                .await,
            Err(CoreError::Timeout(_))
        ));
        assert!(manager
            .wait_for_query_snapshot(SnapshotId::ZERO, Duration::from_millis(10))
            .await
            .is_ok());
    }
}
