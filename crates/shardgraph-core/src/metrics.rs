//! Central metrics registry and metric definitions
//!
//! Metrics are registered lazily on first access using once_cell::Lazy.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

// ===== Snapshot Metrics =====

/// Current cluster query snapshot id
pub static QUERY_SNAPSHOT_ID: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "shardgraph_query_snapshot_id",
        "Newest snapshot id visible to readers"
    )
    .expect("Failed to register query snapshot gauge")
});

/// Current cluster write snapshot id
pub static WRITE_SNAPSHOT_ID: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "shardgraph_write_snapshot_id",
        "Newest snapshot id ingestion may target"
    )
    .expect("Failed to register write snapshot gauge")
});

/// Commit reports by outcome (accepted, stale, rejected, advanced, persist_failed)
pub static COMMIT_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardgraph_commit_reports_total",
        "Total number of store commit reports",
        &["outcome"]
    )
    .expect("Failed to register commit report counter")
});

// ===== Store Write Metrics =====

/// Batch apply duration histogram
pub static BATCH_APPLY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "shardgraph_batch_apply_duration_seconds",
        "Time to apply one ordered batch to every targeted partition",
        &["store"],
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register batch apply histogram")
});

/// Failed partition writes that were scheduled for retry
pub static PARTITION_WRITE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardgraph_partition_write_retries_total",
        "Total number of partition write retries",
        &["partition"]
    )
    .expect("Failed to register partition write retry counter")
});

/// Batches buffered in each store's sort queue
pub static SORT_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "shardgraph_sort_queue_depth",
        "Batches buffered in the sort queue",
        &["store"]
    )
    .expect("Failed to register sort queue depth gauge")
});

// ===== Backup Metrics =====

/// Backup operations by operation and status
pub static BACKUP_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardgraph_backup_operations_total",
        "Total number of backup operations",
        &["operation", "status"]
    )
    .expect("Failed to register backup operations counter")
});

/// Number of persisted backups
pub static BACKUPS_RETAINED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "shardgraph_backups_retained",
        "Number of backups in the persisted backup list"
    )
    .expect("Failed to register retained backups gauge")
});

// ===== RPC Metrics =====

/// Coordinator RPC calls by method and status
pub static RPC_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardgraph_rpc_calls_total",
        "Total number of coordinator RPC calls",
        &["method", "status"]
    )
    .expect("Failed to register RPC call counter")
});

/// Label for a result, as used by every `status` label above.
pub fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn export_prometheus() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        QUERY_SNAPSHOT_ID.set(3);
        BACKUP_OPERATIONS.with_label_values(&["create", "success"]).inc();

        let text = export_prometheus();
        assert!(text.contains("shardgraph_query_snapshot_id"));
        assert!(text.contains("shardgraph_backup_operations_total"));
    }

    #[test]
    fn test_status_label() {
        let ok: Result<(), ()> = Ok(());
        let err: Result<(), ()> = Err(());
        assert_eq!(status_label(&ok), "success");
        assert_eq!(status_label(&err), "error");
    }
}
