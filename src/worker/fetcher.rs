use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::datum::{DatumDescriptor, InputRef};
use crate::error::{Result, WorkerError};
use crate::store::{content_digest, keys, ObjectStore};

/// Time and volume of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    pub elapsed: Duration,
    pub bytes: u64,
}

/// Materializes a datum's input files into a scratch directory.
#[derive(Clone)]
pub struct DatumFetcher {
    store: Arc<dyn ObjectStore>,
    transfer_timeout: Duration,
}

impl DatumFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, transfer_timeout: Duration) -> Self {
        Self {
            store,
            transfer_timeout,
        }
    }

    /// Download every input of `descriptor` into `dest`.
    ///
    /// Each object is checked against its content digest. The caller owns
    /// `dest` and removes it whatever the outcome.
    pub async fn fetch(&self, descriptor: &DatumDescriptor, dest: &Path) -> Result<TransferStats> {
        let start = Instant::now();
        let mut bytes = 0u64;

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| WorkerError::Transfer(format!("creating {}: {}", dest.display(), e)))?;

        for input in &descriptor.inputs {
            bytes += self.fetch_one(input, dest).await?;
        }

        let stats = TransferStats {
            elapsed: start.elapsed(),
            bytes,
        };
        tracing::debug!(
            inputs = descriptor.inputs.len(),
            bytes,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Datum inputs downloaded"
        );
        Ok(stats)
    }

    async fn fetch_one(&self, input: &InputRef, dest: &Path) -> Result<u64> {
        let rel = Path::new(&input.name);
        if input.name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(WorkerError::Transfer(format!(
                "input name {:?} escapes the datum directory",
                input.name
            )));
        }

        let key = keys::object(&input.reference);
        let data = tokio::time::timeout(self.transfer_timeout, self.store.get(&key))
            .await
            .map_err(|_| {
                WorkerError::Transfer(format!(
                    "download of {} timed out after {:?}",
                    key, self.transfer_timeout
                ))
            })??;

        let actual = content_digest(&data);
        if actual != input.reference {
            return Err(WorkerError::Transfer(format!(
                "corrupt reference {}: content hashes to {}",
                input.reference, actual
            )));
        }

        let path = dest.join(rel);
        let local = |e: std::io::Error| {
            WorkerError::Transfer(format!("writing {}: {}", path.display(), e))
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(local)?;
        }
        tokio::fs::write(&path, &data).await.map_err(local)?;
        Ok(data.len() as u64)
    }
}
