//! Backend trait for the partitioned, sorted item table.
//!
//! This module defines the abstraction over the key-value table that holds
//! live queue items, allowing different storage implementations (memory,
//! PostgreSQL, Redis) to be used interchangeably by the queue engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::infrastructure::resilience::CircuitState;
use crate::queue::{QueueItem, SortKey};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional write failed: the key is already taken
    #[error("Item already exists: chunk {chunk_key:?}, sort key {sort_key}")]
    Conflict { chunk_key: String, sort_key: String },

    /// Backend is temporarily unavailable (e.g., circuit breaker open)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configured table layout cannot be used by this backend
    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),
}

/// Names of the table and its attributes.
///
/// These come from configuration so the same engine can target differently
/// shaped tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table_name: String,
    pub chunk_key_name: String,
    pub sort_key_name: String,
    pub ttl_attribute_name: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            table_name: "queue_table".to_string(),
            chunk_key_name: "ckey".to_string(),
            sort_key_name: "skey".to_string(),
            ttl_attribute_name: "expired".to_string(),
        }
    }
}

/// Backend trait for the item table.
///
/// Rows are keyed by `(chunk_key, sort_key)`. Implementations must be
/// thread-safe (`Send + Sync`) as they are shared across request tasks.
///
/// Expired rows are still returned by `query` and `last_sort_key`; filtering
/// is the engine's job, removal is `delete_expired`'s.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend type identifier used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// State of the backend's circuit breaker, if it has one.
    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }

    /// Insert a row unless its key is already present.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if `(chunk_key, sort_key)` exists.
    async fn put_if_absent(&self, item: &QueueItem) -> Result<(), StoreError>;

    /// All rows of a chunk in ascending sort key order.
    async fn query(&self, chunk_key: &str) -> Result<Vec<QueueItem>, StoreError>;

    /// Greatest sort key stored in a chunk.
    async fn last_sort_key(&self, chunk_key: &str) -> Result<Option<SortKey>, StoreError> {
        Ok(self
            .query(chunk_key)
            .await?
            .into_iter()
            .map(|item| item.sort_key)
            .max())
    }

    /// Delete one row. Returns `false` if it did not exist.
    async fn delete(&self, chunk_key: &str, sort_key: &SortKey) -> Result<bool, StoreError>;

    /// Remove every row whose expiry is at or before `now`.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Accepts identifiers made of ASCII letters, digits and underscores that do
/// not start with a digit.
pub(crate) fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidConfig(format!(
            "{:?} is not a valid identifier",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("queue_table").is_ok());
        assert!(validate_identifier("_ckey2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2skey").is_err());
        assert!(validate_identifier("skey; DROP TABLE x").is_err());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::Conflict {
            chunk_key: "c1".into(),
            sort_key: "00000000000000000001".into(),
        };
        assert!(err.to_string().contains("c1"));

        let err = StoreError::Unavailable("Circuit breaker is open".into());
        assert!(err.to_string().contains("Circuit breaker"));
    }
}
