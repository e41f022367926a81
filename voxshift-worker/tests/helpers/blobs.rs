//! Instrumented blob stores

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use voxshift_common::blob::{BlobKey, BlobStore, MemoryBlobStore};
use voxshift_common::Result;

/// Counts every `get` as it starts, sharing storage with `inner`
#[derive(Clone)]
pub struct CountingBlobStore {
    inner: MemoryBlobStore,
    gets: Arc<AtomicUsize>,
}

impl CountingBlobStore {
    pub fn new(inner: MemoryBlobStore) -> Self {
        Self {
            inner,
            gets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared handle to the `get` counter
    pub fn gets(&self) -> Arc<AtomicUsize> {
        self.gets.clone()
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobKey> {
        self.inner.put(bytes).await
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        self.inner.exists(key).await
    }
}
