//! Per-backend circuit breaker for the networked item tables.
//!
//! After `failure_threshold` consecutive backend failures the breaker opens
//! and calls fail fast with `StoreError::Unavailable`. Once the cooldown has
//! passed a single trial call is let through; its outcome closes or reopens
//! the breaker. The current state of each breaker is exported as the
//! `opeq_store_circuit_state` gauge and reported by `/health`.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::StoreConfig;
use crate::metrics::StoreMetrics;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// Value exported on the state gauge.
    pub fn gauge_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CircuitState::HalfOpen,
            2 => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    fn raw(self) -> u8 {
        self.gauge_value() as u8
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before letting a trial call through
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&StoreConfig> for CircuitBreakerConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold.max(1),
            cooldown: Duration::from_millis(config.circuit_cooldown_ms),
        }
    }
}

pub struct CircuitBreaker {
    backend: &'static str,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// ms since epoch of the last opening or trial call
    changed_at_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(backend: &'static str, config: CircuitBreakerConfig) -> Self {
        StoreMetrics::set_circuit_state(backend, CircuitState::Closed.gauge_value());
        Self {
            backend,
            config,
            state: AtomicU8::new(CircuitState::Closed.raw()),
            consecutive_failures: AtomicU32::new(0),
            changed_at_ms: AtomicI64::new(current_time_ms()),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Whether a call may reach the backend now.
    ///
    /// Past the cooldown, exactly one caller wins the trial slot and the
    /// breaker moves to half-open. A trial call that never reports back does
    /// not wedge the breaker: another one is admitted after a further cooldown.
    pub fn try_acquire(&self) -> bool {
        if self.state() == CircuitState::Closed {
            return true;
        }

        let now = current_time_ms();
        let since = self.changed_at_ms.load(Ordering::Acquire);
        if now - since < self.config.cooldown.as_millis() as i64 {
            return false;
        }

        if self
            .changed_at_ms
            .compare_exchange(since, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if self.transition(CircuitState::HalfOpen) {
            tracing::info!(backend = self.backend, "Store circuit half-open, testing backend");
        }
        true
    }

    /// The backend answered, whatever the answer was.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.transition(CircuitState::Closed) {
            tracing::info!(backend = self.backend, "Store circuit closed");
        }
    }

    /// The backend could not be reached or timed out.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        let open = match self.state() {
            CircuitState::Closed => failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if open {
            self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            if self.transition(CircuitState::Open) {
                tracing::warn!(backend = self.backend, failures = failures, "Store circuit opened");
            }
        }
    }

    /// Returns whether the state actually changed.
    fn transition(&self, to: CircuitState) -> bool {
        let from = self.state.swap(to.raw(), Ordering::AcqRel);
        if from == to.raw() {
            return false;
        }
        StoreMetrics::set_circuit_state(self.backend, to.gauge_value());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::encode_metrics;

    fn breaker(backend: &'static str, failure_threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            backend,
            CircuitBreakerConfig {
                failure_threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[test]
    fn test_only_consecutive_failures_open() {
        let cb = breaker("test-consecutive", 3, 60_000);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let cb = breaker("test-trial", 1, 20);
        cb.record_failure();
        assert!(!cb.try_acquire());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire(), "only one trial call per cooldown");

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker("test-reopen", 1, 20);
        cb.record_failure();

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.try_acquire());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn test_state_is_exported_per_backend() {
        let cb = breaker("test-gauge", 1, 60_000);
        cb.record_failure();

        let output = encode_metrics().unwrap();
        assert!(output.contains(r#"opeq_store_circuit_state{backend="test-gauge"} 2"#));
    }

    #[test]
    fn test_config_from_store_settings() {
        let store = StoreConfig {
            circuit_failure_threshold: 0,
            circuit_cooldown_ms: 1_500,
            ..StoreConfig::default()
        };
        let config = CircuitBreakerConfig::from(&store);
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.cooldown, Duration::from_millis(1_500));
    }
}
