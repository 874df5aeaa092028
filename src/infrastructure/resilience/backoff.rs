//! Delays between boundary retries of transient queue failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Growth of the base delay per retry.
const MULTIPLIER: f64 = 2.0;

/// Fraction of the base delay added or removed at random.
const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            jitter_factor: JITTER_FACTOR,
        }
    }
}

impl From<&RetryConfig> for BackoffConfig {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms.max(config.initial_delay_ms),
            jitter_factor: JITTER_FACTOR,
        }
    }
}

/// Doubling delay sequence for one request, capped and jittered.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    next_base_ms: f64,
}

impl ExponentialBackoff {
    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms as f64;
        Self {
            config,
            next_base_ms: initial,
        }
    }

    /// Roughly `initial_delay_ms` first, doubling up to `max_delay_ms`.
    /// Never shorter than 1ms.
    pub fn next_delay(&mut self) -> Duration {
        let max = self.config.max_delay_ms.max(1) as f64;
        let base = self.next_base_ms.min(max);
        self.next_base_ms = base * MULTIPLIER;

        let jitter_range = base * self.config.jitter_factor;
        let delay = if jitter_range > 0.0 {
            base + rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            base
        };

        Duration::from_millis(delay.clamp(1.0, max) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(initial_delay_ms: u64, max_delay_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::with_config(BackoffConfig {
            initial_delay_ms,
            max_delay_ms,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_doubles_until_capped() {
        let mut backoff = exact(50, 300);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
    }

    #[test]
    fn test_zero_delay_is_floored() {
        let mut backoff = exact(0, 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 100,
            jitter_factor: 0.5,
        });

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_from_retry_config() {
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10,
        };
        let config = BackoffConfig::from(&retry);
        assert_eq!(config.initial_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 500);
    }
}
