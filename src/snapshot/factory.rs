//! Blob store factory

use std::sync::Arc;

use crate::config::BlobConfig;

use super::backend::{BlobError, BlobStore};
use super::fs_backend::FsBlobStore;
use super::memory_backend::MemoryBlobStore;

/// Create a blob store based on configuration.
///
/// - `"filesystem"`: files under `root_dir/bucket_name`
/// - `"memory"` (default): in-process map
pub fn create_blob_store(settings: &BlobConfig) -> Result<Arc<dyn BlobStore>, BlobError> {
    match settings.backend.as_str() {
        "filesystem" => {
            let store = FsBlobStore::new(&settings.root_dir, &settings.bucket_name)?;
            tracing::info!(
                backend = "filesystem",
                base_dir = %store.base_dir().display(),
                "Creating filesystem blob store"
            );
            Ok(Arc::new(store))
        }
        other => {
            if other != "memory" {
                tracing::warn!(backend = %other, "Unknown blob backend, falling back to memory");
            }
            tracing::info!(backend = "memory", bucket = %settings.bucket_name, "Creating memory blob store");
            Ok(Arc::new(MemoryBlobStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: &str, root_dir: &str) -> BlobConfig {
        BlobConfig {
            backend: backend.to_string(),
            bucket_name: "db-bucket".to_string(),
            root_dir: root_dir.to_string(),
            retention_seconds: 86_400,
        }
    }

    #[test]
    fn test_memory_default() {
        let store = create_blob_store(&config("memory", "./data")).unwrap();
        assert_eq!(store.backend_name(), "memory");

        let store = create_blob_store(&config("s3", "./data")).unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[test]
    fn test_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_blob_store(&config("filesystem", dir.path().to_str().unwrap())).unwrap();
        assert_eq!(store.backend_name(), "filesystem");
    }
}
