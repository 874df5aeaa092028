//! Single-writer guard serializing queue operations.
//!
//! Each operation holds a `GuardPermit` for its whole duration. Permits are
//! released on drop, so an operation that fails, panics, or is cancelled by
//! a timeout never leaves its chunk locked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::metrics::GuardMetrics;

use super::models::QueueError;

/// Key used for the single lock in global scope.
const GLOBAL_LOCK_KEY: &str = "";

/// Granularity of mutual exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardScope {
    /// One writer per chunk; different chunks proceed independently
    #[default]
    PerChunk,
    /// One writer for the whole queue
    Global,
}

impl GuardScope {
    /// Parse the `queue.guard_scope` setting. Unknown values fall back to
    /// per-chunk scope.
    pub fn from_setting(value: &str) -> Self {
        match value {
            "global" => GuardScope::Global,
            "chunk" => GuardScope::PerChunk,
            other => {
                tracing::warn!(scope = %other, "Unknown guard scope, using per-chunk locking");
                GuardScope::PerChunk
            }
        }
    }
}

/// Proof that the caller is the only writer of its scope.
///
/// Dropping the permit releases the guard.
pub struct GuardPermit {
    chunk_key: String,
    acquired_at: Instant,
    _lock: OwnedMutexGuard<()>,
}

impl GuardPermit {
    pub fn chunk_key(&self) -> &str {
        &self.chunk_key
    }

    /// Release the guard explicitly. Equivalent to dropping the permit.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        GuardMetrics::record_hold(self.acquired_at.elapsed());
    }
}

/// Async mutual exclusion keyed by chunk.
pub struct WriterGuard {
    locks: DashMap<String, Arc<Mutex<()>>>,
    scope: GuardScope,
    acquire_timeout: Duration,
}

impl WriterGuard {
    pub fn new(scope: GuardScope, acquire_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            scope,
            acquire_timeout,
        }
    }

    pub fn scope(&self) -> GuardScope {
        self.scope
    }

    /// Wait until no other operation holds the guard for `chunk_key`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Busy` if the guard is not obtained within the
    /// configured acquisition timeout.
    pub async fn acquire(&self, chunk_key: &str) -> Result<GuardPermit, QueueError> {
        let lock = self.lock_for(chunk_key);
        let started = Instant::now();

        match tokio::time::timeout(self.acquire_timeout, lock.lock_owned()).await {
            Ok(guard) => {
                GuardMetrics::record_wait(started.elapsed());
                Ok(GuardPermit {
                    chunk_key: chunk_key.to_string(),
                    acquired_at: Instant::now(),
                    _lock: guard,
                })
            }
            Err(_) => {
                GuardMetrics::record_busy();
                tracing::warn!(
                    chunk_key = %chunk_key,
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for queue writer guard"
                );
                Err(QueueError::Busy {
                    chunk_key: chunk_key.to_string(),
                })
            }
        }
    }

    /// Whether some operation currently holds the guard for `chunk_key`.
    pub fn is_held(&self, chunk_key: &str) -> bool {
        self.locks
            .get(self.lock_key(chunk_key))
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop lock entries nobody is holding or waiting on.
    ///
    /// Returns the number of entries removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // The map holds one reference; any other means a permit or waiter
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    /// Number of lock entries currently tracked.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    fn lock_key<'a>(&self, chunk_key: &'a str) -> &'a str {
        match self.scope {
            GuardScope::PerChunk => chunk_key,
            GuardScope::Global => GLOBAL_LOCK_KEY,
        }
    }

    fn lock_for(&self, chunk_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(self.lock_key(chunk_key).to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(scope: GuardScope, timeout_ms: u64) -> WriterGuard {
        WriterGuard::new(scope, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let guard = guard(GuardScope::PerChunk, 100);

        let permit = guard.acquire("c1").await.unwrap();
        assert_eq!(permit.chunk_key(), "c1");
        assert!(guard.is_held("c1"));

        permit.release();
        assert!(!guard.is_held("c1"));
        assert!(guard.acquire("c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_busy_when_held() {
        let guard = guard(GuardScope::PerChunk, 20);

        let _permit = guard.acquire("c1").await.unwrap();
        let result = guard.acquire("c1").await;
        assert!(matches!(result, Err(QueueError::Busy { ref chunk_key }) if chunk_key == "c1"));
    }

    #[tokio::test]
    async fn test_chunks_are_independent() {
        let guard = guard(GuardScope::PerChunk, 20);

        let _p1 = guard.acquire("c1").await.unwrap();
        assert!(guard.acquire("c2").await.is_ok());
    }

    #[tokio::test]
    async fn test_global_scope_serializes_all_chunks() {
        let guard = guard(GuardScope::Global, 20);

        let _p1 = guard.acquire("c1").await.unwrap();
        assert!(matches!(guard.acquire("c2").await, Err(QueueError::Busy { .. })));
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let guard = Arc::new(guard(GuardScope::PerChunk, 1_000));

        let permit = guard.acquire("c1").await.unwrap();
        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.acquire("c1").await.map(|p| p.chunk_key().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);

        assert_eq!(waiter.await.unwrap().unwrap(), "c1");
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let guard = guard(GuardScope::PerChunk, 100);

        let held = guard.acquire("c1").await.unwrap();
        drop(guard.acquire("c2").await.unwrap());
        assert_eq!(guard.tracked_locks(), 2);

        assert_eq!(guard.prune_idle(), 1);
        assert_eq!(guard.tracked_locks(), 1);
        drop(held);
    }

    #[test]
    fn test_scope_from_setting() {
        assert_eq!(GuardScope::from_setting("global"), GuardScope::Global);
        assert_eq!(GuardScope::from_setting("chunk"), GuardScope::PerChunk);
        assert_eq!(GuardScope::from_setting("bogus"), GuardScope::PerChunk);
    }
}
