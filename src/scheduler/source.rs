use std::path::PathBuf;

use async_trait::async_trait;

use crate::datum::DatumDescriptor;
use crate::error::{Result, WorkerError};

/// Produces the datums of a job. Each call starts the sequence over.
#[async_trait]
pub trait DatumSource: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DatumDescriptor>>;
}

/// Datums known up front, e.g. from a job manifest.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    datums: Vec<DatumDescriptor>,
}

impl StaticSource {
    pub fn new(datums: Vec<DatumDescriptor>) -> Self {
        Self { datums }
    }
}

#[async_trait]
impl DatumSource for StaticSource {
    async fn enumerate(&self) -> Result<Vec<DatumDescriptor>> {
        Ok(self.datums.clone())
    }
}

/// Datums listed in a JSON file (an array of descriptors), read on every
/// enumeration.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatumSource for FileSource {
    async fn enumerate(&self) -> Result<Vec<DatumDescriptor>> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            WorkerError::Dispatch(format!("reading {}: {}", self.path.display(), e))
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            WorkerError::Dispatch(format!("parsing {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn static_source_is_restartable() {
        let source = StaticSource::new(vec![DatumDescriptor::single("a", "1")]);
        assert_eq!(source.enumerate().await.unwrap().len(), 1);
        assert_eq!(source.enumerate().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_source_reads_descriptors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("datums.json");
        std::fs::write(
            &path,
            r#"[{"inputs":[{"name":"a.csv","reference":"abc"}]},{"inputs":[]}]"#,
        )
        .unwrap();

        let datums = FileSource::new(&path).enumerate().await.unwrap();
        assert_eq!(datums.len(), 2);
        assert_eq!(datums[0].inputs[0].name, "a.csv");
    }

    #[tokio::test]
    async fn missing_file_is_dispatch_fault() {
        let err = FileSource::new("/nonexistent/datums.json")
            .enumerate()
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Dispatch(_)));
    }
}
