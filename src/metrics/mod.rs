//! Prometheus metrics for the operation queue service.
//!
//! This module provides metrics for monitoring the queue:
//! - Operation counts and latency by operation and outcome
//! - Writer guard contention
//! - TTL expiry and snapshot activity
//! - Store backend errors and circuit breaker state

mod helpers;

pub use helpers::{encode_metrics, GuardMetrics, MaintenanceMetrics, OperationMetrics, StoreMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "opeq";

lazy_static! {
    // ============================================================================
    // Operation Metrics
    // ============================================================================

    /// Queue operations by operation name and outcome
    pub static ref OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_operations_total", METRIC_PREFIX),
        "Total queue operations",
        &["operation", "outcome"]
    ).unwrap();

    /// Queue operation latency, guard wait included
    pub static ref OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_operation_latency_seconds", METRIC_PREFIX),
        "Queue operation latency in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Boundary retries of transient failures
    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_retries_total", METRIC_PREFIX),
        "Total retries of transient queue errors",
        &["operation", "kind"]
    ).unwrap();

    // ============================================================================
    // Guard Metrics
    // ============================================================================

    /// Time spent waiting for the writer guard
    pub static ref GUARD_WAIT_SECONDS: Histogram = register_histogram!(
        format!("{}_guard_wait_seconds", METRIC_PREFIX),
        "Time spent waiting for the writer guard",
        vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Time the writer guard was held
    pub static ref GUARD_HOLD_SECONDS: Histogram = register_histogram!(
        format!("{}_guard_hold_seconds", METRIC_PREFIX),
        "Time the writer guard was held",
        vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Guard acquisitions that timed out
    pub static ref GUARD_BUSY_TOTAL: IntCounter = register_int_counter!(
        format!("{}_guard_busy_total", METRIC_PREFIX),
        "Total writer guard acquisitions that timed out"
    ).unwrap();

    /// Chunks with a tracked guard entry
    pub static ref GUARD_LOCKS_TRACKED: IntGauge = register_int_gauge!(
        format!("{}_guard_locks_tracked", METRIC_PREFIX),
        "Number of chunks with a tracked writer guard entry"
    ).unwrap();

    // ============================================================================
    // Maintenance Metrics
    // ============================================================================

    /// Rows removed by the TTL sweep
    pub static ref ITEMS_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_items_expired_total", METRIC_PREFIX),
        "Total expired rows removed by the sweep"
    ).unwrap();

    /// Snapshots written
    pub static ref SNAPSHOTS_WRITTEN_TOTAL: IntCounter = register_int_counter!(
        format!("{}_snapshots_written_total", METRIC_PREFIX),
        "Total snapshots written to blob storage"
    ).unwrap();

    /// Snapshots deleted after the retention window
    pub static ref SNAPSHOTS_PRUNED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_snapshots_pruned_total", METRIC_PREFIX),
        "Total snapshots pruned after the retention window"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    /// Store errors by backend
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Total backing store errors",
        &["backend", "kind"]
    ).unwrap();

    /// Circuit breaker state by backend: 0 closed, 1 half-open, 2 open
    pub static ref STORE_CIRCUIT_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_store_circuit_state", METRIC_PREFIX),
        "Store circuit breaker state (0 closed, 1 half-open, 2 open)",
        &["backend"]
    ).unwrap();
}
