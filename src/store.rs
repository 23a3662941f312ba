//! Object store seam
//!
//! The exchange's object-request responder looks objects up by hash in a
//! store owned by the host application. Only `get`/`put` are needed here;
//! persistence formats are out of scope.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::object::{Object, ObjectHash};

/// Local store of content-addressed objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object by content hash.
    async fn get(&self, hash: &ObjectHash) -> Option<Object>;

    /// Store an object, returning its hash.
    async fn put(&self, object: Object) -> ObjectHash;
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectHash, Object>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, hash: &ObjectHash) -> Option<Object> {
        self.objects.read().await.get(hash).cloned()
    }

    async fn put(&self, object: Object) -> ObjectHash {
        let hash = object.hash();
        self.objects.write().await.insert(hash, object);
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryObjectStore::new();
        let object = Object::new("test/blob", b"bytes".to_vec());
        let hash = store.put(object.clone()).await;

        assert_eq!(store.get(&hash).await, Some(object));
        assert_eq!(store.get(&ObjectHash::from_bytes([0u8; 32])).await, None);
    }

    #[tokio::test]
    async fn test_put_is_idempotent_by_hash() {
        let store = MemoryObjectStore::new();
        let object = Object::new("test/blob", b"bytes".to_vec());
        let h1 = store.put(object.clone()).await;
        let h2 = store.put(object).await;
        assert_eq!(h1, h2);
        assert_eq!(store.len().await, 1);
    }
}
