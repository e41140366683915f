use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ObjectStore;
use crate::error::{Result, WorkerError};

/// In-process store, used by tests and `run` mode.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| WorkerError::Transfer(format!("missing reference {}", key)))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }
}
