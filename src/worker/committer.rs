use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::fetcher::TransferStats;
use crate::datum::Fingerprint;
use crate::error::{Result, WorkerError};
use crate::store::{keys, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub digest: String,
    pub size: u64,
}

/// Index of one datum's output files, keyed by path relative to the output
/// directory. Writing it is the commit point for the datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputManifest {
    pub job_id: String,
    pub fingerprint: Fingerprint,
    pub files: BTreeMap<String, OutputFile>,
    pub total_bytes: u64,
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub manifest_key: String,
    pub stats: TransferStats,
}

/// Uploads sandbox output and commits it under the job/datum key.
#[derive(Clone)]
pub struct OutputCommitter {
    store: Arc<dyn ObjectStore>,
    transfer_timeout: Duration,
}

impl OutputCommitter {
    pub fn new(store: Arc<dyn ObjectStore>, transfer_timeout: Duration) -> Self {
        Self {
            store,
            transfer_timeout,
        }
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.transfer_timeout, fut)
            .await
            .map_err(|_| {
                WorkerError::Transfer(format!(
                    "{} timed out after {:?}",
                    what, self.transfer_timeout
                ))
            })?
    }

    /// Upload every file under `output_dir`, then write the manifest.
    ///
    /// File contents are stored as content objects first; nothing references
    /// them until the manifest lands, so an upload that fails or is cancelled
    /// part way never becomes visible. `reuse_key`, when given, is pointed at
    /// the same manifest after the commit for later jobs to pick up.
    pub async fn commit(
        &self,
        job_id: &str,
        fingerprint: &Fingerprint,
        output_dir: &Path,
        reuse_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommitReceipt> {
        let start = Instant::now();
        let mut files = BTreeMap::new();
        let mut total_bytes = 0u64;

        for (rel, path) in list_files(output_dir).await? {
            if cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            let data = tokio::fs::read(&path).await.map_err(|e| {
                WorkerError::Transfer(format!("reading output {}: {}", path.display(), e))
            })?;
            let size = data.len() as u64;
            let digest = self
                .with_timeout("upload", self.store.put_content(data))
                .await?;
            total_bytes += size;
            files.insert(rel, OutputFile { digest, size });
        }

        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let manifest = OutputManifest {
            job_id: job_id.to_string(),
            fingerprint: fingerprint.clone(),
            files,
            total_bytes,
        };
        let encoded = serde_json::to_vec(&manifest)
            .map_err(|e| WorkerError::Internal(format!("encoding manifest: {}", e)))?;
        let manifest_key = keys::job_datum(job_id, fingerprint);
        self.with_timeout("manifest commit", self.store.put(&manifest_key, encoded.clone()))
            .await?;

        if let Some(reuse_key) = reuse_key {
            // The datum is committed at this point; a missing index entry only
            // costs a later job a recompute.
            if let Err(e) = self
                .with_timeout("reuse index", self.store.put(reuse_key, encoded))
                .await
            {
                tracing::warn!(key = reuse_key, error = %e, "Failed to record output for reuse");
            }
        }

        Ok(CommitReceipt {
            manifest_key,
            stats: TransferStats {
                elapsed: start.elapsed(),
                bytes: total_bytes,
            },
        })
    }

    /// Commit a manifest recorded by an earlier job for the same input.
    /// Returns `None` when nothing is recorded under `reuse_key`.
    pub async fn reuse(
        &self,
        job_id: &str,
        fingerprint: &Fingerprint,
        reuse_key: &str,
    ) -> Result<Option<CommitReceipt>> {
        let start = Instant::now();
        if !self
            .with_timeout("reuse lookup", self.store.exists(reuse_key))
            .await?
        {
            return Ok(None);
        }
        let encoded = self
            .with_timeout("reuse lookup", self.store.get(reuse_key))
            .await?;
        let mut manifest: OutputManifest = serde_json::from_slice(&encoded).map_err(|e| {
            WorkerError::Transfer(format!("corrupt reuse manifest {}: {}", reuse_key, e))
        })?;
        if &manifest.fingerprint != fingerprint {
            return Ok(None);
        }

        manifest.job_id = job_id.to_string();
        let encoded = serde_json::to_vec(&manifest)
            .map_err(|e| WorkerError::Internal(format!("encoding manifest: {}", e)))?;
        let manifest_key = keys::job_datum(job_id, fingerprint);
        self.with_timeout("manifest commit", self.store.put(&manifest_key, encoded))
            .await?;

        Ok(Some(CommitReceipt {
            manifest_key,
            stats: TransferStats {
                elapsed: start.elapsed(),
                bytes: 0,
            },
        }))
    }
}

/// Regular files under `root` as (relative path, absolute path), sorted.
async fn list_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == root => {
                return Ok(files);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| WorkerError::Internal(e.to_string()))?
                    .to_string_lossy()
                    .into_owned();
                files.push((rel, path));
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DatumDescriptor;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn committer(store: &MemoryStore) -> OutputCommitter {
        OutputCommitter::new(Arc::new(store.clone()), Duration::from_secs(5))
    }

    fn fp() -> Fingerprint {
        DatumDescriptor::single("a", "1").fingerprint()
    }

    #[tokio::test]
    async fn commit_uploads_files_and_manifest() {
        let store = MemoryStore::new();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("out.txt"), b"result").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/more.txt"), b"!!").unwrap();

        let receipt = committer(&store)
            .commit("job-1", &fp(), dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.stats.bytes, 8);
        assert_eq!(receipt.manifest_key, keys::job_datum("job-1", &fp()));

        let manifest: OutputManifest =
            serde_json::from_slice(&store.get(&receipt.manifest_key).await.unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.total_bytes, 8);
        let out = &manifest.files["out.txt"];
        assert_eq!(
            store.get(&keys::object(&out.digest)).await.unwrap(),
            b"result"
        );
        assert!(manifest.files.contains_key("sub/more.txt"));
    }

    #[tokio::test]
    async fn empty_output_still_commits() {
        let store = MemoryStore::new();
        let dir = TempDir::new().unwrap();
        let receipt = committer(&store)
            .commit("job-1", &fp(), dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(receipt.stats.bytes, 0);
        assert!(store.exists(&receipt.manifest_key).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_commit_writes_no_manifest() {
        let store = MemoryStore::new();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("out.txt"), b"result").unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = committer(&store)
            .commit("job-1", &fp(), dir.path(), None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        assert!(store.keys_with_prefix("jobs/").await.is_empty());
    }

    #[tokio::test]
    async fn reuse_copies_manifest_to_new_job() {
        let store = MemoryStore::new();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("out.txt"), b"result").unwrap();
        let reuse_key = keys::reuse("edges", 1, &fp());
        let c = committer(&store);

        c.commit("job-1", &fp(), dir.path(), Some(&reuse_key), &CancellationToken::new())
            .await
            .unwrap();
        let receipt = c.reuse("job-2", &fp(), &reuse_key).await.unwrap().unwrap();

        let manifest: OutputManifest =
            serde_json::from_slice(&store.get(&receipt.manifest_key).await.unwrap()).unwrap();
        assert_eq!(manifest.job_id, "job-2");
        assert!(manifest.files.contains_key("out.txt"));
    }

    #[tokio::test]
    async fn reuse_misses_without_index() {
        let store = MemoryStore::new();
        let got = committer(&store)
            .reuse("job-2", &fp(), &keys::reuse("edges", 1, &fp()))
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
