//! In-memory blob store using DashMap.
//!
//! Objects are lost on service restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::backend::{validate_path, BlobError, BlobObject, BlobStore};

struct StoredObject {
    body: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit creation time.
    pub fn put_at(
        &self,
        path: &str,
        body: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Result<(), BlobError> {
        validate_path(path)?;

        match self.objects.entry(path.to_string()) {
            Entry::Occupied(_) => Err(BlobError::AlreadyExists(path.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(StoredObject { body, created_at });
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, path: &str, body: Vec<u8>) -> Result<(), BlobError> {
        self.put_at(path, body, Utc::now())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        validate_path(path)?;
        Ok(self.objects.get(path).map(|o| o.body.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        let mut objects: Vec<BlobObject> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| BlobObject {
                path: entry.key().clone(),
                created_at: entry.created_at,
                size: entry.body.len() as u64,
            })
            .collect();

        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn delete(&self, path: &str) -> Result<bool, BlobError> {
        Ok(self.objects.remove(path).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryBlobStore::new();
        store.put("snapshot/c1/a.json", b"{}".to_vec()).await.unwrap();

        assert_eq!(store.get("snapshot/c1/a.json").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("snapshot/c1/missing.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_once() {
        let store = MemoryBlobStore::new();
        store.put("snapshot/c1/a.json", b"1".to_vec()).await.unwrap();

        let result = store.put("snapshot/c1/a.json", b"2".to_vec()).await;
        assert!(matches!(result, Err(BlobError::AlreadyExists(_))));
        assert_eq!(store.get("snapshot/c1/a.json").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_list_sorted_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("snapshot/c1/b.json", vec![]).await.unwrap();
        store.put("snapshot/c1/a.json", vec![]).await.unwrap();
        store.put("snapshot/c2/a.json", vec![]).await.unwrap();

        let paths: Vec<String> = store
            .list("snapshot/c1/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.path)
            .collect();
        assert_eq!(paths, vec!["snapshot/c1/a.json", "snapshot/c1/b.json"]);
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let store = MemoryBlobStore::new();
        let now = Utc::now();
        store.put_at("snapshot/c1/old.json", vec![], now - Duration::days(2)).unwrap();
        store.put_at("snapshot/c1/new.json", vec![], now).unwrap();

        let removed = store
            .prune_older_than("snapshot/", now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("snapshot/c1/new.json").await.unwrap().is_some());
    }
}
