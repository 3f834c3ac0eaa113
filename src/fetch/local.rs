// ==============================================================================
// fetch/local.rs - Local File Transport
// ==============================================================================
// Description: Range reads over files on the local filesystem
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-09-29
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{FetchError, FileStat, RangeFetch};

#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RangeFetch for LocalFile {
    async fn read(&self, length: u64, offset: u64) -> Result<Bytes, FetchError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let size = file.metadata().await?.len();
        if length == 0 || offset >= size {
            return Ok(Bytes::new());
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::with_capacity(length.min(size - offset) as usize);
        file.take(length).read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    async fn read_file(&self) -> Result<Bytes, FetchError> {
        Ok(Bytes::from(tokio::fs::read(&self.path).await?))
    }

    async fn stat(&self) -> Result<FileStat, FetchError> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        Ok(FileStat { size: metadata.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_range_reads() {
        let temp = create_test_file(b"abcdefghij");
        let file = LocalFile::new(temp.path());

        assert_eq!(&file.read(3, 2).await.unwrap()[..], b"cde");
        assert_eq!(&file.read(50, 7).await.unwrap()[..], b"hij");
        assert!(file.read(5, 10).await.unwrap().is_empty());
        assert_eq!(file.stat().await.unwrap().size, 10);
        assert_eq!(file.read_to_string().await.unwrap(), "abcdefghij");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let file = LocalFile::new("/nonexistent/annotations.gff3.gz");
        assert!(matches!(file.read(1, 0).await, Err(FetchError::Io(_))));
    }
}
