//! Object storage abstraction.
//!
//! Records are stored as opaque byte blobs under string keys. The trait is
//! the seam where a real backend (S3, GCS, a database) would plug in; the
//! in-memory implementation backs tests and local runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

/// Errors from a storage backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store operation failed for {key}: {message}")]
    Backend { key: String, message: String },

    #[error("store list failed: {0}")]
    List(String),

    #[error("record serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Key/blob storage for serialized call records.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a blob. Overwrites silently.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read a blob; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory store. Keys iterate in sorted order, matching what object
/// stores guarantee for listings.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.objects.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = MemoryStore::new();
        store.put("a/k", b"payload".to_vec()).await.unwrap();
        assert_eq!(store.get("a/k").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.get("a/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_by_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("b/2", vec![]).await.unwrap();
        store.put("a/2", vec![]).await.unwrap();
        store.put("a/1", vec![]).await.unwrap();
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }
}
