//! Retry and fail-fast helpers for talking to backing stores.
//!
//! - `ExponentialBackoff`: delays between boundary retries of transient errors
//! - `CircuitBreaker`: stops hammering a store that keeps failing

mod backoff;
mod circuit_breaker;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
