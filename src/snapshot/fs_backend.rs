//! Filesystem blob store.
//!
//! Objects are files under `<root>/<bucket>/<path>`. A write goes to a hidden
//! staging file next to the target and is hard-linked into place, so readers
//! never see a partial object and an existing object is never overwritten.
//! Hidden files are not objects and are skipped by `list`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::backend::{validate_path, BlobError, BlobObject, BlobStore};

pub struct FsBlobStore {
    base: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root_dir/bucket_name`.
    pub fn new(root_dir: impl AsRef<Path>, bucket_name: &str) -> Result<Self, BlobError> {
        validate_path(bucket_name)?;
        if bucket_name.contains('/') {
            return Err(BlobError::InvalidPath(bucket_name.to_string()));
        }

        Ok(Self {
            base: root_dir.as_ref().join(bucket_name),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.base.clone(), |acc, seg| acc.join(seg)))
    }

    /// Convert a file path under the base back to a `/`-separated object path.
    fn object_path(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.base).ok()?;
        let segments: Option<Vec<&str>> = relative.iter().map(|s| s.to_str()).collect();
        Some(segments?.join("/"))
    }

    /// Directory to start listing from: the deepest complete directory of
    /// the prefix.
    fn list_root(&self, prefix: &str) -> PathBuf {
        match prefix.rfind('/') {
            Some(idx) => prefix[..idx]
                .split('/')
                .filter(|s| !s.is_empty() && *s != "." && *s != "..")
                .fold(self.base.clone(), |acc, seg| acc.join(seg)),
            None => self.base.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, path: &str, body: Vec<u8>) -> Result<(), BlobError> {
        let file_path = self.resolve(path)?;
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = staging_path(&file_path);
        let published = match write_synced(&staging, &body).await {
            Ok(()) => fs::hard_link(&staging, &file_path).await,
            Err(e) => Err(e),
        };
        // The staging name is dropped whether or not the object was published
        if let Err(e) = fs::remove_file(&staging).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
            }
        }

        match published {
            Ok(()) => {
                tracing::debug!(path = %path, bytes = body.len(), "Wrote blob object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(BlobError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        match fs::read(self.resolve(path)?).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        let mut objects = Vec::new();
        let mut pending = vec![self.list_root(prefix)];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                    continue;
                }

                if is_hidden(&entry.path()) {
                    continue;
                }
                let Some(path) = self.object_path(&entry.path()) else {
                    continue;
                };
                if !path.starts_with(prefix) {
                    continue;
                }

                let created_at = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                objects.push(BlobObject {
                    path,
                    created_at,
                    size: metadata.len(),
                });
            }
        }

        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn delete(&self, path: &str) -> Result<bool, BlobError> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hidden sibling of `target` with a random suffix.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix: u64 = rand::rng().random();
    target.with_file_name(format!(".{}.{:016x}.tmp", name, suffix))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(body).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "db-bucket").unwrap();
        (dir, store)
    }

    #[test]
    fn test_rejects_bad_bucket() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsBlobStore::new(dir.path(), "").is_err());
        assert!(FsBlobStore::new(dir.path(), "..").is_err());
        assert!(FsBlobStore::new(dir.path(), "a/b").is_err());
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        store.put("snapshot/c1/a.json", b"{\"a\":1}".to_vec()).await.unwrap();

        let body = store.get("snapshot/c1/a.json").await.unwrap();
        assert_eq!(body, Some(b"{\"a\":1}".to_vec()));
        assert!(store.base_dir().join("snapshot").join("c1").join("a.json").exists());
        assert_eq!(store.get("snapshot/c1/none.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_once() {
        let (_dir, store) = store();
        store.put("snapshot/c1/a.json", b"1".to_vec()).await.unwrap();

        let result = store.put("snapshot/c1/a.json", b"2".to_vec()).await;
        assert!(matches!(result, Err(BlobError::AlreadyExists(_))));
        assert_eq!(store.get("snapshot/c1/a.json").await.unwrap(), Some(b"1".to_vec()));
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_no_file_behind() {
        let (_dir, store) = store();
        let chunk_dir = store.base_dir().join("snapshot").join("c1");
        // Something that is not a finished object already holds the name
        std::fs::create_dir_all(chunk_dir.join("a.json")).unwrap();

        let result = store.put("snapshot/c1/a.json", b"{}".to_vec()).await;
        assert!(matches!(result, Err(BlobError::AlreadyExists(_))));
        assert_eq!(file_names(&chunk_dir), vec!["a.json"]);

        store.put("snapshot/c1/b.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(file_names(&chunk_dir), vec!["a.json", "b.json"]);
    }

    #[tokio::test]
    async fn test_staging_files_are_not_listed() {
        let (_dir, store) = store();
        store.put("snapshot/c1/a.json", b"{}".to_vec()).await.unwrap();

        let chunk_dir = store.base_dir().join("snapshot").join("c1");
        std::fs::write(chunk_dir.join(".b.json.00000000000000ff.tmp"), b"{\"trunc").unwrap();

        let listed: Vec<String> = store
            .list("snapshot/c1/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.path)
            .collect();
        assert_eq!(listed, vec!["snapshot/c1/a.json"]);
    }

    #[tokio::test]
    async fn test_list_recurses_and_filters() {
        let (_dir, store) = store();
        store.put("snapshot/c1/b.json", vec![1]).await.unwrap();
        store.put("snapshot/c1/a.json", vec![1, 2]).await.unwrap();
        store.put("snapshot/c2/a.json", vec![]).await.unwrap();
        store.put("other/x.json", vec![]).await.unwrap();

        let c1: Vec<String> = store
            .list("snapshot/c1/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.path)
            .collect();
        assert_eq!(c1, vec!["snapshot/c1/a.json", "snapshot/c1/b.json"]);

        let all = store.list("snapshot/").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].size, 2);

        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_prune() {
        let (_dir, store) = store();
        store.put("snapshot/c1/a.json", vec![]).await.unwrap();

        assert!(store.delete("snapshot/c1/a.json").await.unwrap());
        assert!(!store.delete("snapshot/c1/a.json").await.unwrap());

        store.put("snapshot/c1/b.json", vec![]).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(store.prune_older_than("snapshot/", cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (_dir, store) = store();
        let result = store.put("../outside.json", vec![]).await;
        assert!(matches!(result, Err(BlobError::InvalidPath(_))));
    }
}
