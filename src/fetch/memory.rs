// ==============================================================================
// fetch/memory.rs - In-Memory Transport
// ==============================================================================
// Description: Range reads over an in-memory buffer (embedding and tests)
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-10-09
// Version: 1.0.1
// ==============================================================================

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{slice_range, FetchError, FileStat, RangeFetch};

/// An in-memory resource with a few knobs for simulating awkward servers
#[derive(Debug)]
pub struct MemoryFile {
    name: String,
    data: Bytes,
    hide_size: bool,
    fail_after_reads: Option<usize>,
    read_calls: AtomicUsize,
    bytes_served: AtomicU64,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            hide_size: false,
            fail_after_reads: None,
            read_calls: AtomicUsize::new(0),
            bytes_served: AtomicU64::new(0),
        }
    }

    /// Report `UNKNOWN_SIZE` from `stat()`
    pub fn with_hidden_size(mut self) -> Self {
        self.hide_size = true;
        self
    }

    /// Fail every range read after the first `reads` succeed
    pub fn with_failure_after(mut self, reads: usize) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    /// Number of range reads issued so far
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Bytes handed out by range reads so far
    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RangeFetch for MemoryFile {
    async fn read(&self, length: u64, offset: u64) -> Result<Bytes, FetchError> {
        let call = self.read_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after_reads {
            if call >= limit {
                return Err(FetchError::Status {
                    status: 503,
                    url: format!("memory://{}", self.name),
                });
            }
        }

        let bytes = slice_range(&self.data, length, offset);
        self.bytes_served.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        Ok(bytes)
    }

    async fn read_file(&self) -> Result<Bytes, FetchError> {
        Ok(self.data.clone())
    }

    async fn stat(&self) -> Result<FileStat, FetchError> {
        if self.hide_size {
            return Ok(FileStat::unknown());
        }
        Ok(FileStat {
            size: self.data.len() as u64,
        })
    }
}
