//! Queue data model: items, sort keys, snapshots and the queue error taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of the zero-padded decimal encoding of a sort key.
pub const SORT_KEY_WIDTH: usize = 20;

/// Ordering key of an item within a chunk.
///
/// Keys are fixed-width zero-padded decimal counters, so lexicographic order
/// (what the stores sort by) equals numeric order (arrival order).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortKey(u64);

impl SortKey {
    pub fn from_counter(value: u64) -> Self {
        Self(value)
    }

    pub fn counter(&self) -> u64 {
        self.0
    }

    /// Compute the key for the next item of a chunk.
    ///
    /// The result tracks wall-clock time in microseconds but is always
    /// strictly greater than `last`, so a clock step backwards can never
    /// reuse a key.
    pub fn next_after(last: Option<&SortKey>, now: DateTime<Utc>) -> Self {
        let clock = now.timestamp_micros().max(0) as u64;
        match last {
            Some(last) => Self(clock.max(last.0.saturating_add(1))),
            None => Self(clock),
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        if value.len() != SORT_KEY_WIDTH || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid sort key: {:?}", value));
        }
        value
            .parse::<u64>()
            .map(Self)
            .map_err(|e| format!("invalid sort key {:?}: {}", value, e))
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = SORT_KEY_WIDTH)
    }
}

impl TryFrom<String> for SortKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        key.to_string()
    }
}

/// A single entry of the operation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Partition the item belongs to
    pub chunk_key: String,
    /// Position of the item within its chunk
    pub sort_key: SortKey,
    /// Caller-supplied data
    pub payload: String,
    /// Expiry time (second precision)
    pub expires_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create an item expiring `ttl_seconds` after `now`.
    ///
    /// The expiry is truncated to whole seconds because the stores persist it
    /// as epoch seconds.
    pub fn new(
        chunk_key: impl Into<String>,
        sort_key: SortKey,
        payload: impl Into<String>,
        now: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Self {
        let epoch = now.timestamp().saturating_add(ttl_seconds as i64);
        Self {
            chunk_key: chunk_key.into(),
            sort_key,
            payload: payload.into(),
            expires_at: expiry_from_epoch(epoch),
        }
    }

    /// Expiry as epoch seconds, the representation used by the stores.
    pub fn expires_at_epoch(&self) -> i64 {
        self.expires_at.timestamp()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Convert a stored epoch-seconds TTL attribute back into a timestamp.
pub fn expiry_from_epoch(epoch: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(epoch, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A row that could not be removed by `delete_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDelete {
    pub sort_key: SortKey,
    pub reason: String,
}

/// Outcome of clearing a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// Rows removed by this call
    pub deleted: usize,
    /// Rows whose deletion failed
    pub failed: Vec<FailedDelete>,
}

impl DeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Descriptor of a snapshot written to blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub bucket_path: String,
    pub created_at: DateTime<Utc>,
    pub item_count: usize,
    pub last_sort_key: Option<SortKey>,
}

/// Serialized body of a snapshot object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub chunk_key: String,
    /// Last sort key contained in the snapshot
    pub skey: Option<SortKey>,
    /// Payloads in sort key order
    pub data: Vec<String>,
    pub items: Vec<QueueItem>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotDocument {
    pub fn from_items(chunk_key: &str, items: Vec<QueueItem>, created_at: DateTime<Utc>) -> Self {
        Self {
            chunk_key: chunk_key.to_string(),
            skey: items.last().map(|item| item.sort_key.clone()),
            data: items.iter().map(|item| item.payload.clone()).collect(),
            items,
            created_at,
        }
    }
}

/// Errors surfaced by the operation queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The writer guard could not be acquired in time
    #[error("Queue busy: chunk {chunk_key:?} is locked by another operation")]
    Busy { chunk_key: String },

    /// The backing store failed or timed out
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A conditional write detected a concurrent writer
    #[error("Operation conflict on chunk {chunk_key:?} at sort key {sort_key}")]
    OperationConflict { chunk_key: String, sort_key: String },

    /// The request itself is malformed
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl QueueError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, QueueError::InvalidInput(_))
    }

    /// Stable machine-readable identifier of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Busy { .. } => "BUSY",
            QueueError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            QueueError::OperationConflict { .. } => "OPERATION_CONFLICT",
            QueueError::InvalidInput(_) => "INVALID_INPUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sort_key_display_is_fixed_width() {
        let key = SortKey::from_counter(42);
        assert_eq!(key.to_string(), "00000000000000000042");
        assert_eq!(SortKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_sort_key_lexicographic_matches_numeric() {
        let a = SortKey::from_counter(9).to_string();
        let b = SortKey::from_counter(10).to_string();
        assert!(a < b);
    }

    #[test]
    fn test_sort_key_rejects_malformed() {
        assert!(SortKey::parse("42").is_err());
        assert!(SortKey::parse("0000000000000000004x").is_err());
    }

    #[test]
    fn test_next_after_is_strictly_greater() {
        let now = Utc::now();
        let ahead = SortKey::from_counter(now.timestamp_micros() as u64 + 1_000_000);
        let next = SortKey::next_after(Some(&ahead), now);
        assert_eq!(next.counter(), ahead.counter() + 1);

        let behind = SortKey::from_counter(1);
        let next = SortKey::next_after(Some(&behind), now);
        assert_eq!(next.counter(), now.timestamp_micros() as u64);
    }

    #[test]
    fn test_item_expiry() {
        let now = Utc::now();
        let item = QueueItem::new("c1", SortKey::from_counter(1), "x", now, 60);
        assert!(!item.is_expired(now));
        assert!(item.is_expired(now + Duration::seconds(61)));

        let immediate = QueueItem::new("c1", SortKey::from_counter(2), "x", now, 0);
        assert!(immediate.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn test_item_serializes_sort_key_as_string() {
        let item = QueueItem::new("c1", SortKey::from_counter(7), "x", Utc::now(), 60);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["sort_key"], "00000000000000000007");
    }

    #[test]
    fn test_snapshot_document_from_items() {
        let now = Utc::now();
        let items = vec![
            QueueItem::new("c1", SortKey::from_counter(1), "a", now, 60),
            QueueItem::new("c1", SortKey::from_counter(2), "b", now, 60),
        ];
        let doc = SnapshotDocument::from_items("c1", items, now);
        assert_eq!(doc.data, vec!["a", "b"]);
        assert_eq!(doc.skey, Some(SortKey::from_counter(2)));
    }

    #[test]
    fn test_error_retryability() {
        assert!(QueueError::Busy { chunk_key: "c".into() }.is_retryable());
        assert!(QueueError::StoreUnavailable("down".into()).is_retryable());
        assert!(!QueueError::InvalidInput("bad".into()).is_retryable());
        assert_eq!(QueueError::StoreUnavailable("x".into()).kind(), "STORE_UNAVAILABLE");
    }
}
