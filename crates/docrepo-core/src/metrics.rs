//! Prometheus metrics for the repository layer.
//!
//! Metrics are registered lazily on first access using `once_cell::Lazy` and
//! live in the default registry, so `prometheus::gather()` sees them.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

/// Lock protocol operations by operation (acquire/commit/abandon/error) and outcome.
pub static LOCK_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "docrepo_lock_operations_total",
        "Total number of entity lock operations",
        &["collection", "operation", "outcome"]
    )
    .expect("Failed to register lock operations counter")
});

/// Index reconciliation actions by kind (create/drop/recreate).
pub static INDEX_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "docrepo_index_actions_total",
        "Total number of index reconciliation actions executed",
        &["collection", "action"]
    )
    .expect("Failed to register index actions counter")
});

/// Documents written by write-buffer flushes.
pub static BUFFER_FLUSHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "docrepo_buffer_flushed_documents_total",
        "Total number of buffered documents flushed to the store",
        &["collection", "trigger"]
    )
    .expect("Failed to register buffer flush counter")
});

/// Documents removed by compression sweeps.
pub static COMPRESSION_REMOVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "docrepo_compression_removed_documents_total",
        "Total number of documents folded away by compression",
        &["collection", "granularity"]
    )
    .expect("Failed to register compression counter")
});

/// Renders every registered metric in Prometheus text format.
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to UTF-8: {}", e);
        String::from("# Error encoding metrics\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let _ = &*LOCK_OPERATIONS;
        let _ = &*INDEX_ACTIONS;
        let _ = &*BUFFER_FLUSHED;
        let _ = &*COMPRESSION_REMOVED;
    }

    #[test]
    fn test_lock_metrics_exported() {
        LOCK_OPERATIONS
            .with_label_values(&["orders", "acquire", "ok"])
            .inc();

        let text = export_metrics();
        assert!(text.contains("docrepo_lock_operations_total"));
    }
}
