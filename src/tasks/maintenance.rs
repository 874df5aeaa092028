use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::config::MaintenanceConfig;
use crate::queue::OperationQueue;

/// Background task for TTL sweeps, periodic snapshots and housekeeping
pub struct MaintenanceTask {
    config: MaintenanceConfig,
    queue: Arc<OperationQueue>,
    shutdown: broadcast::Receiver<()>,
}

impl MaintenanceTask {
    pub fn new(
        config: MaintenanceConfig,
        queue: Arc<OperationQueue>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            queue,
            shutdown,
        }
    }

    /// Run until the shutdown signal fires
    pub async fn run(mut self) {
        if !self.config.enabled {
            tracing::info!("Maintenance task disabled");
            return;
        }

        let sweep_interval = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        let mut sweep_timer = tokio::time::interval(sweep_interval);
        // Skip immediate first tick
        sweep_timer.tick().await;

        let mut snapshot_timer = if self.config.snapshot_interval_seconds > 0 {
            let mut timer =
                tokio::time::interval(Duration::from_secs(self.config.snapshot_interval_seconds));
            timer.tick().await;
            Some(timer)
        } else {
            None
        };

        tracing::info!(
            sweep_interval_secs = sweep_interval.as_secs(),
            snapshot_interval_secs = self.config.snapshot_interval_seconds,
            snapshot_chunks = ?self.config.snapshot_chunks,
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    self.run_sweep_cycle().await;
                }
                _ = async {
                    match snapshot_timer.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.run_snapshot_cycle().await;
                }
            }
        }

        tracing::info!("Maintenance task stopped");
    }

    /// Remove expired items, prune old snapshots and idle guard entries
    pub async fn run_sweep_cycle(&self) {
        let start = Instant::now();

        let expired = match self.queue.sweep_expired().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Expiry sweep failed");
                0
            }
        };

        let pruned = match self.queue.prune_snapshots().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot pruning failed");
                0
            }
        };

        let idle_guards = self.queue.prune_idle_guards();

        tracing::debug!(
            expired = expired,
            snapshots_pruned = pruned,
            idle_guards = idle_guards,
            duration_ms = start.elapsed().as_millis() as u64,
            "Maintenance sweep completed"
        );
    }

    /// Snapshot every configured chunk in parallel
    pub async fn run_snapshot_cycle(&self) {
        let futures: Vec<_> = self
            .config
            .snapshot_chunks
            .iter()
            .map(|chunk| async move { (chunk, self.queue.snapshot(chunk).await) })
            .collect();

        let mut written = 0;
        for (chunk, result) in join_all(futures).await {
            match result {
                Ok(snapshot) => {
                    written += 1;
                    tracing::debug!(
                        chunk_key = %chunk,
                        path = %snapshot.bucket_path,
                        items = snapshot.item_count,
                        "Periodic snapshot written"
                    );
                }
                Err(e) => {
                    tracing::warn!(chunk_key = %chunk, error = %e, "Periodic snapshot failed");
                }
            }
        }

        if written > 0 {
            tracing::info!(
                written = written,
                configured = self.config.snapshot_chunks.len(),
                "Periodic snapshots completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EngineConfig, GuardScope, WriterGuard};
    use crate::snapshot::MemoryBlobStore;
    use crate::store::MemoryStore;

    fn queue(ttl: u64) -> Arc<OperationQueue> {
        let config = EngineConfig {
            item_ttl_seconds: ttl,
            ..EngineConfig::default()
        };
        Arc::new(OperationQueue::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBlobStore::new()),
            WriterGuard::new(GuardScope::PerChunk, Duration::from_millis(200)),
            config,
        ))
    }

    fn config(chunks: &[&str]) -> MaintenanceConfig {
        MaintenanceConfig {
            enabled: true,
            sweep_interval_seconds: 30,
            snapshot_interval_seconds: 0,
            snapshot_chunks: chunks.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_sweep_cycle_removes_expired_items() {
        let queue = queue(0);
        queue.enqueue("c1", "stale".into()).await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let task = MaintenanceTask::new(config(&[]), queue.clone(), rx);
        task.run_sweep_cycle().await;

        assert_eq!(queue.sweep_expired().await.unwrap(), 0);
        assert_eq!(queue.guard().tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_cycle_covers_configured_chunks() {
        let queue = queue(60);
        queue.enqueue("c1", "a".into()).await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let task = MaintenanceTask::new(config(&["c1", "c2", "bad/chunk"]), queue.clone(), rx);
        task.run_snapshot_cycle().await;

        assert_eq!(queue.latest_snapshot("c1").await.unwrap().unwrap().data, vec!["a"]);
        assert!(queue.latest_snapshot("c2").await.unwrap().unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let task = MaintenanceTask::new(config(&[]), queue(60), rx);
        let handle = tokio::spawn(task.run());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_returns_immediately() {
        let (_tx, rx) = broadcast::channel(1);
        let mut disabled = config(&[]);
        disabled.enabled = false;

        tokio::time::timeout(
            Duration::from_secs(1),
            MaintenanceTask::new(disabled, queue(60), rx).run(),
        )
        .await
        .expect("disabled task kept running");
    }
}
