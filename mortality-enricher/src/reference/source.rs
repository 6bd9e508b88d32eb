use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Where reference tables are read from.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Read the full contents of the table at `location`.
    async fn read(&self, location: &str) -> Result<Vec<u8>>;
}

/// Reads tables from the local filesystem. Accepts plain paths and
/// `file://` URIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTableSource;

impl FileTableSource {
    fn resolve(location: &str) -> Result<PathBuf> {
        let location = location.trim();
        if let Some(path) = location.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some((scheme, _)) = location.split_once("://") {
            bail!("Unsupported reference table scheme '{scheme}' in {location}");
        }
        Ok(PathBuf::from(location))
    }
}

#[async_trait]
impl TableSource for FileTableSource {
    async fn read(&self, location: &str) -> Result<Vec<u8>> {
        let path = Self::resolve(location)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read reference table {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_plain_paths_and_file_uris() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        tokio::fs::write(&path, b"Date,Setting,Category,Count\n")
            .await
            .unwrap();

        let plain = FileTableSource.read(path.to_str().unwrap()).await.unwrap();
        let uri = FileTableSource
            .read(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(plain, uri);
    }

    #[tokio::test]
    async fn test_rejects_remote_schemes_and_missing_files() {
        let err = FileTableSource
            .read("hdfs://namenode:9000/data/table.csv")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hdfs"));

        assert!(FileTableSource
            .read("/definitely/not/here.csv")
            .await
            .is_err());
    }
}
