//! The operation queue engine.
//!
//! `OperationQueue` is the single entry point for queue operations. Every
//! operation on a chunk runs under the writer guard and within the
//! configured operation timeout, so at most one enqueue/list/delete/snapshot
//! is in flight per chunk (or overall, in global scope) and a hung store call
//! cannot hold the guard forever.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::Settings;
use crate::infrastructure::resilience::CircuitState;
use crate::metrics::{MaintenanceMetrics, OperationMetrics, StoreMetrics};
use crate::snapshot::{BlobError, BlobStore};
use crate::store::{KvStore, StoreError};

use super::guard::{GuardScope, WriterGuard};
use super::models::{
    DeleteReport, FailedDelete, QueueError, QueueItem, Snapshot, SnapshotDocument, SortKey,
};

/// Root prefix of every snapshot object.
pub const SNAPSHOT_ROOT: &str = "snapshot/";

/// Path segment standing in for the empty chunk key.
const EMPTY_CHUNK_SEGMENT: &str = "_";

/// Marker doubled in front of keys that already start with it.
const SEGMENT_ESCAPE: char = '_';

/// Runtime parameters of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk used by callers that do not name one
    pub default_chunk_key: String,
    /// Lifetime of an enqueued item
    pub item_ttl_seconds: u64,
    /// Upper bound on a whole operation, guard wait included
    pub operation_timeout: Duration,
    /// Age after which snapshots are pruned
    pub snapshot_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chunk_key: "TEST_OPE".to_string(),
            item_ttl_seconds: 60,
            operation_timeout: Duration::from_secs(10),
            snapshot_retention: Duration::from_secs(86_400),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_chunk_key: settings.queue.default_chunk_key.clone(),
            item_ttl_seconds: settings.queue.item_ttl_seconds,
            operation_timeout: Duration::from_millis(settings.queue.operation_timeout_ms),
            snapshot_retention: Duration::from_secs(settings.blob.retention_seconds),
        }
    }
}

/// Reject chunk keys that cannot be used as a snapshot path segment.
///
/// The empty key is valid: it is the single-key mode.
pub fn validate_chunk_key(chunk_key: &str) -> Result<(), QueueError> {
    let invalid = chunk_key == "."
        || chunk_key.contains('/')
        || chunk_key.contains('\\')
        || chunk_key.contains("..")
        || chunk_key.chars().any(char::is_control);

    if invalid {
        Err(QueueError::InvalidInput(format!(
            "chunk key {:?} may not contain '/', '..' or control characters",
            chunk_key
        )))
    } else {
        Ok(())
    }
}

/// Path segment of a chunk under `snapshot/`.
///
/// The empty key maps to `_` and keys starting with `_` get one more `_` in
/// front, so distinct chunk keys never share a segment.
fn chunk_segment(chunk_key: &str) -> Cow<'_, str> {
    if chunk_key.is_empty() {
        Cow::Borrowed(EMPTY_CHUNK_SEGMENT)
    } else if chunk_key.starts_with(SEGMENT_ESCAPE) {
        Cow::Owned(format!("{}{}", SEGMENT_ESCAPE, chunk_key))
    } else {
        Cow::Borrowed(chunk_key)
    }
}

/// Prefix under which all snapshots of a chunk live.
pub fn snapshot_prefix(chunk_key: &str) -> String {
    format!("{}{}/", SNAPSHOT_ROOT, chunk_segment(chunk_key))
}

/// Deterministic object path of a snapshot taken at `at`.
///
/// The timestamp is fixed width so paths of one chunk sort chronologically.
pub fn snapshot_path(chunk_key: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}.json",
        snapshot_prefix(chunk_key),
        at.format("%Y%m%dT%H%M%S%6fZ")
    )
}

/// Operation queue over a key-value store and a blob store.
pub struct OperationQueue {
    store: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    guard: WriterGuard,
    config: EngineConfig,
}

impl OperationQueue {
    pub fn new(
        store: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        guard: WriterGuard,
        config: EngineConfig,
    ) -> Self {
        tracing::info!(
            store = store.backend_name(),
            blobs = blobs.backend_name(),
            scope = ?guard.scope(),
            item_ttl_seconds = config.item_ttl_seconds,
            "Operation queue initialized"
        );

        Self {
            store,
            blobs,
            guard,
            config,
        }
    }

    /// Build the engine from settings around already created stores.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let guard = WriterGuard::new(
            GuardScope::from_setting(&settings.queue.guard_scope),
            Duration::from_millis(settings.queue.guard_timeout_ms),
        );
        Self::new(store, blobs, guard, EngineConfig::from_settings(settings))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_chunk_key(&self) -> &str {
        &self.config.default_chunk_key
    }

    pub fn guard(&self) -> &WriterGuard {
        &self.guard
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn store_circuit_state(&self) -> Option<CircuitState> {
        self.store.circuit_state()
    }

    pub fn blob_backend(&self) -> &'static str {
        self.blobs.backend_name()
    }

    /// Append `payload` to the end of a chunk.
    ///
    /// The new item's sort key is greater than every key stored in the
    /// chunk, expired rows included.
    #[tracing::instrument(skip(self, payload), fields(store = self.store.backend_name()))]
    pub async fn enqueue(&self, chunk_key: &str, payload: String) -> Result<QueueItem, QueueError> {
        validate_chunk_key(chunk_key)?;

        self.guarded("enqueue", chunk_key, async {
            let last = self
                .store
                .last_sort_key(chunk_key)
                .await
                .map_err(|e| self.store_error(e))?;

            let now = Utc::now();
            let sort_key = SortKey::next_after(last.as_ref(), now);
            let item = QueueItem::new(
                chunk_key,
                sort_key,
                payload,
                now,
                self.config.item_ttl_seconds,
            );

            self.store
                .put_if_absent(&item)
                .await
                .map_err(|e| self.store_error(e))?;

            tracing::debug!(
                chunk_key = %chunk_key,
                sort_key = %item.sort_key,
                expires_at = %item.expires_at,
                "Item enqueued"
            );
            Ok(item)
        })
        .await
    }

    /// All live items of a chunk in ascending sort key order.
    #[tracing::instrument(skip(self), fields(store = self.store.backend_name()))]
    pub async fn list(&self, chunk_key: &str) -> Result<Vec<QueueItem>, QueueError> {
        validate_chunk_key(chunk_key)?;

        self.guarded("list", chunk_key, self.live_items(chunk_key))
            .await
    }

    /// Delete every row of a chunk, expired ones included.
    ///
    /// Rows that could not be deleted are reported, not hidden.
    #[tracing::instrument(skip(self), fields(store = self.store.backend_name()))]
    pub async fn delete_all(&self, chunk_key: &str) -> Result<DeleteReport, QueueError> {
        validate_chunk_key(chunk_key)?;

        self.guarded("delete_all", chunk_key, async {
            let rows = self
                .store
                .query(chunk_key)
                .await
                .map_err(|e| self.store_error(e))?;

            let mut report = DeleteReport::default();
            for row in rows {
                match self.store.delete(chunk_key, &row.sort_key).await {
                    Ok(true) => report.deleted += 1,
                    // Already gone, e.g. swept between query and delete
                    Ok(false) => {}
                    Err(e) => {
                        StoreMetrics::record_error(self.store.backend_name(), store_error_kind(&e));
                        report.failed.push(FailedDelete {
                            sort_key: row.sort_key,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if report.is_complete() {
                tracing::info!(chunk_key = %chunk_key, deleted = report.deleted, "Chunk cleared");
            } else {
                tracing::warn!(
                    chunk_key = %chunk_key,
                    deleted = report.deleted,
                    failed = report.failed.len(),
                    "Chunk partially cleared"
                );
            }
            Ok(report)
        })
        .await
    }

    /// Write the live items of a chunk to blob storage.
    ///
    /// The rows themselves are left untouched.
    #[tracing::instrument(skip(self), fields(blobs = self.blobs.backend_name()))]
    pub async fn snapshot(&self, chunk_key: &str) -> Result<Snapshot, QueueError> {
        validate_chunk_key(chunk_key)?;

        self.guarded("snapshot", chunk_key, async {
            let items = self.live_items(chunk_key).await?;
            let created_at = Utc::now();
            let bucket_path = snapshot_path(chunk_key, created_at);

            let document = SnapshotDocument::from_items(chunk_key, items, created_at);
            let body = serde_json::to_vec(&document).map_err(|e| {
                QueueError::StoreUnavailable(format!("Failed to serialize snapshot: {}", e))
            })?;

            self.blobs
                .put(&bucket_path, body)
                .await
                .map_err(|e| self.blob_error(chunk_key, e))?;

            MaintenanceMetrics::record_snapshot_written();
            tracing::info!(
                chunk_key = %chunk_key,
                path = %bucket_path,
                items = document.items.len(),
                "Snapshot written"
            );

            Ok(Snapshot {
                bucket_path,
                created_at,
                item_count: document.items.len(),
                last_sort_key: document.skey,
            })
        })
        .await
    }

    /// Read back the newest snapshot of a chunk.
    #[tracing::instrument(skip(self), fields(blobs = self.blobs.backend_name()))]
    pub async fn latest_snapshot(
        &self,
        chunk_key: &str,
    ) -> Result<Option<SnapshotDocument>, QueueError> {
        validate_chunk_key(chunk_key)?;

        self.guarded("latest_snapshot", chunk_key, async {
            let objects = self
                .blobs
                .list(&snapshot_prefix(chunk_key))
                .await
                .map_err(|e| self.blob_error(chunk_key, e))?;

            let Some(newest) = objects.last() else {
                return Ok(None);
            };

            // Pruned between list and get
            let Some(body) = self
                .blobs
                .get(&newest.path)
                .await
                .map_err(|e| self.blob_error(chunk_key, e))?
            else {
                return Ok(None);
            };

            let document: SnapshotDocument = serde_json::from_slice(&body).map_err(|e| {
                QueueError::StoreUnavailable(format!(
                    "Snapshot {} is not readable: {}",
                    newest.path, e
                ))
            })?;
            Ok(Some(document))
        })
        .await
    }

    /// Remove expired rows from every chunk.
    pub async fn sweep_expired(&self) -> Result<usize, QueueError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.operation_timeout,
            self.store.delete_expired(Utc::now()),
        )
        .await
        {
            Ok(result) => result.map_err(|e| self.store_error(e)),
            Err(_) => Err(self.timed_out("sweep_expired")),
        };

        record("sweep_expired", &result, started.elapsed());
        let removed = result?;
        MaintenanceMetrics::record_expired(removed);
        if removed > 0 {
            tracing::info!(removed = removed, "Expired items swept");
        }
        Ok(removed)
    }

    /// Delete snapshots older than the retention window.
    pub async fn prune_snapshots(&self) -> Result<usize, QueueError> {
        let retention = chrono::Duration::from_std(self.config.snapshot_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.operation_timeout,
            self.blobs.prune_older_than(SNAPSHOT_ROOT, cutoff),
        )
        .await
        {
            Ok(result) => result.map_err(|e| QueueError::StoreUnavailable(e.to_string())),
            Err(_) => Err(self.timed_out("prune_snapshots")),
        };

        record("prune_snapshots", &result, started.elapsed());
        let removed = result?;
        MaintenanceMetrics::record_snapshots_pruned(removed);
        if removed > 0 {
            tracing::info!(removed = removed, cutoff = %cutoff, "Old snapshots pruned");
        }
        Ok(removed)
    }

    /// Forget guard entries of chunks nobody is using.
    pub fn prune_idle_guards(&self) -> usize {
        self.guard.prune_idle()
    }

    async fn live_items(&self, chunk_key: &str) -> Result<Vec<QueueItem>, QueueError> {
        let now = Utc::now();
        let rows = self
            .store
            .query(chunk_key)
            .await
            .map_err(|e| self.store_error(e))?;
        Ok(rows.into_iter().filter(|item| !item.is_expired(now)).collect())
    }

    /// Run `work` holding the guard for `chunk_key`, bounded by the
    /// operation timeout.
    ///
    /// On timeout `work` is dropped before the permit, so the guard is free
    /// again when this returns.
    async fn guarded<T>(
        &self,
        operation: &'static str,
        chunk_key: &str,
        work: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        let started = Instant::now();

        let bounded = async {
            let _permit = self.guard.acquire(chunk_key).await?;
            work.await
        };

        let result = match tokio::time::timeout(self.config.operation_timeout, bounded).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(operation)),
        };

        record(operation, &result, started.elapsed());
        result
    }

    fn timed_out(&self, operation: &str) -> QueueError {
        let timeout_ms = self.config.operation_timeout.as_millis() as u64;
        tracing::warn!(operation = %operation, timeout_ms = timeout_ms, "Queue operation timed out");
        QueueError::StoreUnavailable(format!("{} timed out after {}ms", operation, timeout_ms))
    }

    fn store_error(&self, err: StoreError) -> QueueError {
        match err {
            StoreError::Conflict {
                chunk_key,
                sort_key,
            } => QueueError::OperationConflict {
                chunk_key,
                sort_key,
            },
            other => {
                StoreMetrics::record_error(self.store.backend_name(), store_error_kind(&other));
                tracing::error!(store = self.store.backend_name(), error = %other, "Store operation failed");
                QueueError::StoreUnavailable(other.to_string())
            }
        }
    }

    fn blob_error(&self, chunk_key: &str, err: BlobError) -> QueueError {
        match err {
            // Two snapshots of one chunk within the same microsecond
            BlobError::AlreadyExists(path) => QueueError::OperationConflict {
                chunk_key: chunk_key.to_string(),
                sort_key: path,
            },
            other => {
                StoreMetrics::record_error(self.blobs.backend_name(), "blob");
                tracing::error!(blobs = self.blobs.backend_name(), error = %other, "Blob operation failed");
                QueueError::StoreUnavailable(other.to_string())
            }
        }
    }
}

fn record<T>(operation: &str, result: &Result<T, QueueError>, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    OperationMetrics::record(operation, outcome, elapsed);
}

fn store_error_kind(err: &StoreError) -> &'static str {
    match err {
        StoreError::Conflict { .. } => "conflict",
        StoreError::Unavailable(_) => "unavailable",
        StoreError::Postgres(_) => "postgres",
        StoreError::Redis(_) => "redis",
        StoreError::Serialization(_) => "serialization",
        StoreError::InvalidConfig(_) => "invalid_config",
    }
}
