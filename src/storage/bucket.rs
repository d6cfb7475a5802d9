//! Object-storage abstraction for tablets, raw blobs, LFS payloads, and
//! super-chunks, with an in-memory implementation for tests and a
//! filesystem implementation for single-node deployments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::errors::GitError;

/// Flat key/value blob storage. Keys are slash-delimited paths. Writes are
/// idempotent per key; content-addressed callers head before putting.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GitError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, GitError>;
    async fn head(&self, key: &str) -> Result<bool, GitError>;
    async fn delete(&self, key: &str) -> Result<(), GitError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, GitError>;
}

/// Write `bytes` only when `key` is absent (content-addressable dedup).
pub async fn put_if_absent(
    bucket: &dyn BucketStore,
    key: &str,
    bytes: Bytes,
) -> Result<bool, GitError> {
    if bucket.head(key).await? {
        return Ok(false);
    }
    bucket.put(key, bytes).await?;
    Ok(true)
}

/// In-memory bucket backed by a concurrent map.
#[derive(Default)]
pub struct MemoryBucket {
    objects: DashMap<String, Bytes>,
}

impl MemoryBucket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BucketStore for MemoryBucket {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GitError> {
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, GitError> {
        Ok(self.objects.get(key).map(|v| v.clone()))
    }

    async fn head(&self, key: &str) -> Result<bool, GitError> {
        Ok(self.objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), GitError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Filesystem bucket: each key maps to a file under the root. Writes go
/// through a temp file and rename so readers never see partial objects.
pub struct FsBucket {
    root: PathBuf,
}

impl FsBucket {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, GitError> {
        if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(GitError::Fatal(format!("unsafe bucket key `{key}`")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BucketStore for FsBucket {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GitError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp-write");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, GitError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<bool, GitError> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), GitError> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Some(key) = relative_key(&self.root, &path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Memory bucket: put/get/head/delete/list behave per contract.
    #[tokio::test]
    async fn memory_bucket_contract() {
        let bucket = MemoryBucket::new();
        assert!(!bucket.head("a/b").await.unwrap());
        bucket.put("a/b", Bytes::from_static(b"one")).await.unwrap();
        bucket.put("a/c", Bytes::from_static(b"two")).await.unwrap();
        bucket.put("z", Bytes::from_static(b"three")).await.unwrap();

        assert_eq!(bucket.get("a/b").await.unwrap().unwrap(), "one");
        assert!(bucket.head("a/b").await.unwrap());
        assert_eq!(bucket.list("a/").await.unwrap(), vec!["a/b", "a/c"]);

        bucket.delete("a/b").await.unwrap();
        assert!(bucket.get("a/b").await.unwrap().is_none());
    }

    /// put_if_absent is a no-op on an existing key.
    #[tokio::test]
    async fn put_if_absent_dedups() {
        let bucket = MemoryBucket::new();
        assert!(
            put_if_absent(&*bucket, "k", Bytes::from_static(b"v1"))
                .await
                .unwrap()
        );
        assert!(
            !put_if_absent(&*bucket, "k", Bytes::from_static(b"v2"))
                .await
                .unwrap()
        );
        assert_eq!(bucket.get("k").await.unwrap().unwrap(), "v1");
    }

    /// Filesystem bucket round-trips through a temp directory.
    #[tokio::test]
    async fn fs_bucket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = FsBucket::new(dir.path());
        bucket
            .put("repo/objects/abc.tbl", Bytes::from_static(b"tablet"))
            .await
            .unwrap();
        assert_eq!(
            bucket.get("repo/objects/abc.tbl").await.unwrap().unwrap(),
            "tablet"
        );
        assert_eq!(
            bucket.list("repo/objects/").await.unwrap(),
            vec!["repo/objects/abc.tbl"]
        );
        bucket.delete("repo/objects/abc.tbl").await.unwrap();
        assert!(bucket.get("repo/objects/abc.tbl").await.unwrap().is_none());
        // deleting again is a no-op
        bucket.delete("repo/objects/abc.tbl").await.unwrap();
    }

    /// Path traversal in keys is rejected.
    #[tokio::test]
    async fn fs_bucket_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = FsBucket::new(dir.path());
        assert!(bucket.get("../escape").await.is_err());
        assert!(bucket.put("a//b", Bytes::new()).await.is_err());
    }
}
