//! Content-addressed store client.
//!
//! The worker treats the store as a durable key/value API. Input and output
//! file contents live under `objects/<sha256-hex>`; job and reuse manifests
//! live under named keys (see [`keys`]).

pub mod keys;
mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the bytes stored under `key`. A missing key is a transfer fault.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`. The write is all-or-nothing: readers observe
    /// either the previous value (or absence) or the complete new value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Store `bytes` as a content object and return its digest.
    async fn put_content(&self, bytes: Vec<u8>) -> Result<String> {
        let digest = content_digest(&bytes);
        let key = keys::object(&digest);
        if !self.exists(&key).await? {
            self.put(&key, bytes).await?;
        }
        Ok(digest)
    }
}

/// Hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        assert_eq!(
            content_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn put_content_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.put_content(b"hello".to_vec()).await.unwrap();
        let b = store.put_content(b"hello".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&keys::object(&a)).await.unwrap(), b"hello");
    }
}
