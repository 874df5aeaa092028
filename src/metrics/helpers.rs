//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    GUARD_BUSY_TOTAL, GUARD_HOLD_SECONDS, GUARD_WAIT_SECONDS, ITEMS_EXPIRED_TOTAL,
    OPERATIONS_TOTAL, OPERATION_LATENCY, RETRIES_TOTAL, SNAPSHOTS_PRUNED_TOTAL,
    SNAPSHOTS_WRITTEN_TOTAL, STORE_CIRCUIT_STATE, STORE_ERRORS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording queue operation metrics
pub struct OperationMetrics;

impl OperationMetrics {
    /// Record a finished operation; `outcome` is "ok" or an error kind
    pub fn record(operation: &str, outcome: &str, elapsed: Duration) {
        OPERATIONS_TOTAL
            .with_label_values(&[operation, outcome])
            .inc();
        OPERATION_LATENCY
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a boundary retry
    pub fn record_retry(operation: &str, kind: &str) {
        RETRIES_TOTAL.with_label_values(&[operation, kind]).inc();
    }
}

/// Helper struct for recording writer guard metrics
pub struct GuardMetrics;

impl GuardMetrics {
    pub fn record_wait(waited: Duration) {
        GUARD_WAIT_SECONDS.observe(waited.as_secs_f64());
    }

    pub fn record_hold(held: Duration) {
        GUARD_HOLD_SECONDS.observe(held.as_secs_f64());
    }

    pub fn record_busy() {
        GUARD_BUSY_TOTAL.inc();
    }
}

/// Helper struct for recording background maintenance metrics
pub struct MaintenanceMetrics;

impl MaintenanceMetrics {
    pub fn record_expired(count: usize) {
        ITEMS_EXPIRED_TOTAL.inc_by(count as u64);
    }

    pub fn record_snapshot_written() {
        SNAPSHOTS_WRITTEN_TOTAL.inc();
    }

    pub fn record_snapshots_pruned(count: usize) {
        SNAPSHOTS_PRUNED_TOTAL.inc_by(count as u64);
    }
}

/// Helper struct for recording store backend metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_error(backend: &str, kind: &str) {
        STORE_ERRORS_TOTAL.with_label_values(&[backend, kind]).inc();
    }

    pub fn set_circuit_state(backend: &str, value: i64) {
        STORE_CIRCUIT_STATE.with_label_values(&[backend]).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        OperationMetrics::record("enqueue", "ok", Duration::from_millis(3));
        GuardMetrics::record_busy();

        let output = encode_metrics().unwrap();
        assert!(output.contains("opeq_operations_total"));
        assert!(output.contains("opeq_guard_busy_total"));
    }
}
