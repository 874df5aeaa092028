//! Lazily connected Redis handle for the item table.

use std::future::Future;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::infrastructure::resilience::{CircuitBreaker, CircuitState};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

/// One multiplexed connection shared by every request task.
///
/// The connection is opened on first use and discarded after a transport
/// failure so the next call reconnects. Only transport failures count
/// against the circuit breaker; command errors such as `WRONGTYPE` are
/// answers from a healthy server.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    breaker: Arc<CircuitBreaker>,
}

impl RedisPool {
    pub fn new(url: &str, breaker: Arc<CircuitBreaker>) -> Result<Self, PoolError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: RwLock::new(None),
            breaker,
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `f` on the shared connection.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        if !self.breaker.try_acquire() {
            return Err(PoolError::CircuitOpen);
        }

        let conn = self.connection().await?;
        let result = f(conn).await;

        match &result {
            Err(e) if is_transport_failure(e) => {
                *self.connection.write().await = None;
                self.breaker.record_failure();
            }
            _ => self.breaker.record_success(),
        }

        result.map_err(PoolError::Redis)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.connection.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                tracing::info!("Redis connection established");
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }
}

fn is_transport_failure(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_timeout() || err.is_connection_refusal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::resilience::CircuitBreakerConfig;

    fn breaker(failure_threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "redis-pool-test",
            CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            },
        ))
    }

    #[test]
    fn test_invalid_url() {
        assert!(RedisPool::new("not a url", breaker(5)).is_err());
    }

    #[tokio::test]
    async fn test_open_circuit_skips_the_command() {
        let cb = breaker(1);
        let pool = RedisPool::new("redis://localhost:6379", cb.clone()).unwrap();
        cb.record_failure();
        assert_eq!(pool.circuit_state(), CircuitState::Open);

        let mut ran = false;
        let result = pool
            .execute(|_conn| {
                ran = true;
                async { Ok::<(), RedisError>(()) }
            })
            .await;

        assert!(matches!(result, Err(PoolError::CircuitOpen)));
        assert!(!ran);
    }

    #[test]
    fn test_command_errors_are_not_transport_failures() {
        let wrong_type = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!is_transport_failure(&wrong_type));

        let io = RedisError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(is_transport_failure(&io));
    }
}
