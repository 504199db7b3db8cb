use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Large-payload blob KV, addressed by opaque key (§4.6). Keys are
/// collision-free within a process lifetime; the ingestion pipeline (C9)
/// offloads bodies past a configured size threshold here and substitutes a
/// `{marker, key}` descriptor in the stored capture.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>);
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn delete(&self, key: &str);
}

pub struct InMemoryPayloadStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self { blobs: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.write().await.insert(key.to_string(), bytes);
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().await.get(key).cloned()
    }

    async fn delete(&self, key: &str) {
        self.blobs.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = InMemoryPayloadStore::new();
        store.put("k1", b"hello".to_vec()).await;
        assert_eq!(store.get("k1").await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = InMemoryPayloadStore::new();
        assert_eq!(store.get("nope").await, None);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = InMemoryPayloadStore::new();
        store.put("k1", b"hello".to_vec()).await;
        store.delete("k1").await;
        assert_eq!(store.get("k1").await, None);
    }
}
