use std::collections::HashMap;
use std::sync::Mutex;

use super::{BlobStore, Result};

/// In-memory blob store for tests and for single-instance deployments that
/// don't need durability across restarts.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs
            .lock()
            .expect("blob store mutex poisoned")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .expect("blob store mutex poisoned")
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryBlobStore::new();
        store.put("bafy123", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("bafy123").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }
}
