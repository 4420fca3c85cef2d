use super::*;
use crate::sync::Arc;
use dashmap::DashMap;

/// Keeps every object in memory. Clones share the same objects.
#[derive(Default, Debug, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<ContentHash, Arc<Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, data: &[u8]) -> Result<ObjectRef, ObjectStoreError> {
        let hash = ContentHash::of(data);
        self.objects
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(data.to_vec()));
        Ok(ObjectRef {
            hash,
            size: data.len() as u64,
        })
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .get(hash)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| ObjectStoreError::ObjectNotFound { hash: hash.clone() })
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool, ObjectStoreError> {
        Ok(self.objects.contains_key(hash))
    }

    async fn list_refs(&self) -> Result<Vec<ObjectRef>, ObjectStoreError> {
        Ok(self
            .objects
            .iter()
            .map(|entry| ObjectRef {
                hash: entry.key().clone(),
                size: entry.value().len() as u64,
            })
            .collect())
    }

    async fn delete(&self, hash: &ContentHash) -> Result<(), ObjectStoreError> {
        self.objects.remove(hash);
        Ok(())
    }
}
