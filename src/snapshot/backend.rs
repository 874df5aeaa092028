//! Backend trait for path-addressed, write-once snapshot objects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during blob store operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Objects are immutable; a second write to the same path is refused
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// The path is absolute, empty or escapes the bucket
    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    /// Filesystem operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listing entry for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Backend trait for snapshot storage.
///
/// Paths are relative and `/`-separated (`snapshot/c1/20260101T000000000000Z.json`).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend type identifier used in logs.
    fn backend_name(&self) -> &'static str;

    /// Write a new object.
    ///
    /// # Errors
    ///
    /// Returns `BlobError::AlreadyExists` if `path` is taken.
    async fn put(&self, path: &str, body: Vec<u8>) -> Result<(), BlobError>;

    /// Read an object back by exact path.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Objects whose path starts with `prefix`, sorted by path.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError>;

    /// Delete an object. Returns `false` if it did not exist.
    async fn delete(&self, path: &str) -> Result<bool, BlobError>;

    /// Delete objects under `prefix` created before `cutoff`.
    ///
    /// # Returns
    ///
    /// The number of objects removed.
    async fn prune_older_than(
        &self,
        prefix: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, BlobError> {
        let mut removed = 0;
        for object in self.list(prefix).await? {
            if object.created_at < cutoff && self.delete(&object.path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Reject paths that are empty, absolute, or contain `.`/`..`/empty segments.
pub(crate) fn validate_path(path: &str) -> Result<(), BlobError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        Err(BlobError::InvalidPath(path.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("snapshot/c1/20260101T000000000000Z.json").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("snapshot/../secret").is_err());
        assert!(validate_path("snapshot//x.json").is_err());
        assert!(validate_path("snapshot\\x.json").is_err());
    }
}
