use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use super::ObjectStore;
use crate::error::{Result, WorkerError};

/// Store rooted at a local directory. Keys map to relative file paths.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(WorkerError::Transfer(format!("invalid store key {:?}", key)));
        }
        Ok(self.root.join(rel))
    }
}

fn transfer(key: &str, e: std::io::Error) -> WorkerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        WorkerError::Transfer(format!("missing reference {}", key))
    } else {
        WorkerError::Transfer(format!("{}: {}", key, e))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| transfer(key, e))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer(key, e))?;
        }

        // Write aside and rename so readers never see a partial object.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(transfer(key, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(transfer(key, e));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| transfer(key, e))
    }
}
