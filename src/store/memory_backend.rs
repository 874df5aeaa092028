//! In-memory item table using DashMap.
//!
//! Rows live in one `BTreeMap` per chunk so queries come back sorted.
//! Data is lost on service restart and there is no native TTL: expired rows
//! stay until `delete_expired` runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::queue::{QueueItem, SortKey};

use super::backend::{KvStore, StoreError};

/// In-memory item table.
#[derive(Default)]
pub struct MemoryStore {
    chunks: DashMap<String, BTreeMap<SortKey, QueueItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows across all chunks, expired ones included.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put_if_absent(&self, item: &QueueItem) -> Result<(), StoreError> {
        let mut chunk = self.chunks.entry(item.chunk_key.clone()).or_default();

        if chunk.contains_key(&item.sort_key) {
            return Err(StoreError::Conflict {
                chunk_key: item.chunk_key.clone(),
                sort_key: item.sort_key.to_string(),
            });
        }

        chunk.insert(item.sort_key.clone(), item.clone());
        Ok(())
    }

    async fn query(&self, chunk_key: &str) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .chunks
            .get(chunk_key)
            .map(|chunk| chunk.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn last_sort_key(&self, chunk_key: &str) -> Result<Option<SortKey>, StoreError> {
        Ok(self
            .chunks
            .get(chunk_key)
            .and_then(|chunk| chunk.keys().next_back().cloned()))
    }

    async fn delete(&self, chunk_key: &str, sort_key: &SortKey) -> Result<bool, StoreError> {
        let removed = match self.chunks.get_mut(chunk_key) {
            Some(mut chunk) => chunk.remove(sort_key).is_some(),
            None => false,
        };

        self.chunks.remove_if(chunk_key, |_, chunk| chunk.is_empty());
        Ok(removed)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;

        // Collect chunk keys first to avoid holding shard locks
        let chunk_keys: Vec<String> = self.chunks.iter().map(|r| r.key().clone()).collect();

        for chunk_key in chunk_keys {
            if let Some(mut chunk) = self.chunks.get_mut(&chunk_key) {
                let before = chunk.len();
                chunk.retain(|_, item| !item.is_expired(now));
                removed += before - chunk.len();
            }
            self.chunks.remove_if(&chunk_key, |_, chunk| chunk.is_empty());
        }

        if removed > 0 {
            tracing::debug!(
                removed = removed,
                remaining_chunks = self.chunks.len(),
                "Removed expired rows from memory store"
            );
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(chunk: &str, counter: u64, ttl: u64) -> QueueItem {
        QueueItem::new(chunk, SortKey::from_counter(counter), format!("p{}", counter), Utc::now(), ttl)
    }

    #[tokio::test]
    async fn test_put_and_query_sorted() {
        let store = MemoryStore::new();
        store.put_if_absent(&item("c1", 3, 60)).await.unwrap();
        store.put_if_absent(&item("c1", 1, 60)).await.unwrap();
        store.put_if_absent(&item("c1", 2, 60)).await.unwrap();

        let rows = store.query("c1").await.unwrap();
        let keys: Vec<u64> = rows.iter().map(|r| r.sort_key.counter()).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(
            store.last_sort_key("c1").await.unwrap(),
            Some(SortKey::from_counter(3))
        );
    }

    #[tokio::test]
    async fn test_put_conflict() {
        let store = MemoryStore::new();
        store.put_if_absent(&item("c1", 1, 60)).await.unwrap();

        let result = store.put_if_absent(&item("c1", 1, 60)).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        // Same sort key in another chunk is fine
        store.put_if_absent(&item("c2", 1, 60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_unknown_chunk_is_empty() {
        let store = MemoryStore::new();
        assert!(store.query("missing").await.unwrap().is_empty());
        assert_eq!(store.last_sort_key("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.put_if_absent(&item("c1", 1, 60)).await.unwrap();

        assert!(store.delete("c1", &SortKey::from_counter(1)).await.unwrap());
        assert!(!store.delete("c1", &SortKey::from_counter(1)).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = MemoryStore::new();
        store.put_if_absent(&item("c1", 1, 0)).await.unwrap();
        store.put_if_absent(&item("c1", 2, 3600)).await.unwrap();
        store.put_if_absent(&item("c2", 1, 0)).await.unwrap();

        let removed = store
            .delete_expired(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.query("c2").await.unwrap().is_empty());
    }
}
