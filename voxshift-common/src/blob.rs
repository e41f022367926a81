//! Content-addressed blob storage
//!
//! Blobs are keyed by the lower-case hex SHA-256 of their bytes, so storing
//! the same audio twice yields the same key and one file.

use crate::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Handle to a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    /// Key for `bytes` under content addressing
    pub fn for_content(bytes: &[u8]) -> Self {
        Self(content_key(bytes))
    }

    /// Accept a key read back from the ledger, rejecting anything that is not a
    /// SHA-256 hex digest.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(Error::Blob(format!("Invalid blob key: {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case hex SHA-256
pub fn content_key(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobKey>;

    /// Fails with [`Error::NotFound`] for unknown keys
    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>>;

    /// Deleting a missing blob is not an error
    async fn delete(&self, key: &BlobKey) -> Result<()>;

    async fn exists(&self, key: &BlobKey) -> Result<bool>;
}

/// Blobs as files under a root directory, fanned out by key prefix
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root.join(&key.as_str()[..2]).join(key.as_str())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobKey> {
        let key = BlobKey::for_content(&bytes);
        let path = self.path_for(&key);
        if tokio::fs::try_exists(&path).await? {
            return Ok(key);
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Write then rename so readers never observe a partial blob
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key = %key, bytes = bytes.len(), "Stored blob");
        Ok(key)
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Blob {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }
}

/// In-process store for tests and throwaway deployments
#[derive(Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<BlobKey, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &BlobKey) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlobKey, Vec<u8>>> {
        // A poisoned map is still a valid map
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobKey> {
        let key = BlobKey::for_content(&bytes);
        self.lock().entry(key.clone()).or_insert(bytes);
        Ok(key)
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Blob {}", key)))
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_is_sha256_hex() {
        let key = BlobKey::for_content(b"abc");
        assert_eq!(
            key.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(BlobKey::parse(key.as_str()).unwrap(), key);
    }

    #[test]
    fn parse_rejects_paths_and_uppercase() {
        assert!(BlobKey::parse("../../etc/passwd").is_err());
        assert!(BlobKey::parse(&"A".repeat(64)).is_err());
        assert!(BlobKey::parse("abc").is_err());
    }

    #[tokio::test]
    async fn fs_store_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        let key = store.put(b"hello".to_vec()).await.unwrap();
        let again = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(key, again);
        assert_eq!(store.get(&key).await.unwrap(), b"hello");
        assert!(store.exists(&key).await.unwrap());

        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap_err().is_not_found());
        // Second delete is a no-op
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_dedupes_content() {
        let store = MemoryBlobStore::new();
        let a = store.put(vec![1, 2, 3]).await.unwrap();
        let b = store.put(vec![1, 2, 3]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);

        store.delete(&a).await.unwrap();
        assert!(store.is_empty());
        assert!(store.get(&a).await.unwrap_err().is_not_found());
    }
}
