// ==============================================================================
// fetch/mod.rs - Range Fetch Abstraction
// ==============================================================================
// Description: Byte-range reads over remote, local and in-memory resources
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-10
// Version: 1.1.0
// ==============================================================================

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

pub mod http;
pub mod local;
pub mod memory;

pub use http::{HttpFile, HttpOptions};
pub use local::LocalFile;
pub use memory::MemoryFile;

/// Sentinel returned by `stat()` when the resource size cannot be trusted
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Best-effort resource metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
}

impl FileStat {
    pub fn unknown() -> Self {
        Self { size: UNKNOWN_SIZE }
    }

    pub fn known_size(&self) -> Option<u64> {
        (self.size != UNKNOWN_SIZE).then_some(self.size)
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("Unexpected HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid resource location: {0}")]
    InvalidLocation(String),
}

/// Random-access reads over a byte resource
///
/// Reads past the end return whatever suffix is available (possibly empty)
/// rather than failing.
#[async_trait]
pub trait RangeFetch: Debug + Send + Sync {
    /// Read up to `length` bytes starting at `offset`
    async fn read(&self, length: u64, offset: u64) -> Result<Bytes, FetchError>;

    /// Read the whole resource
    async fn read_file(&self) -> Result<Bytes, FetchError>;

    /// Read the whole resource as text (lossy UTF-8)
    async fn read_to_string(&self) -> Result<String, FetchError> {
        let bytes = self.read_file().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Approximate size, or `UNKNOWN_SIZE` when the transport cannot tell
    async fn stat(&self) -> Result<FileStat, FetchError>;

    /// Release cached state
    async fn close(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Open a resource, choosing the transport from the location's scheme
///
/// `http://` and `https://` use HTTP range requests; `file://` and bare paths
/// read from the local filesystem.
pub fn open_resource(location: &str) -> Result<Arc<dyn RangeFetch>, FetchError> {
    let location = location.trim();
    if location.is_empty() {
        return Err(FetchError::InvalidLocation("empty location".to_string()));
    }

    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(Arc::new(HttpFile::new(location, HttpOptions::default())?));
    }

    if let Some(path) = location.strip_prefix("file://") {
        return Ok(Arc::new(LocalFile::new(path)));
    }

    if location.contains("://") {
        return Err(FetchError::InvalidLocation(format!(
            "unsupported scheme in {}",
            location
        )));
    }

    Ok(Arc::new(LocalFile::new(location)))
}

/// Slice `[offset, offset + length)` out of a full resource body, clamped to its end
pub(crate) fn slice_range(body: &Bytes, length: u64, offset: u64) -> Bytes {
    let len = body.len() as u64;
    if offset >= len {
        return Bytes::new();
    }
    let end = offset.saturating_add(length).min(len);
    body.slice(offset as usize..end as usize)
}
