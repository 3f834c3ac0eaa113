// ==============================================================================
// bgzf.rs - Block-Compressed Virtual Reader
// ==============================================================================
// Description: Logical (decompressed) reads over a remote BGZF file via .gzi
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-10-17
// Version: 1.2.1
// ==============================================================================
// References:
// - SAM/BAM spec §4.1 (BGZF): https://samtools.github.io/hts-specs/SAMv1.pdf
// - bgzip .gzi layout (little-endian):
//     u64 number_entries
//     number_entries x (u64 compressed_offset, u64 uncompressed_offset)
//   One entry per block start after the first block (which is implicitly 0,0).
// ==============================================================================

use bytes::Bytes;
use std::io::{Cursor, Read};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::fetch::{FetchError, RangeFetch};

/// Largest possible BGZF block (compressed), per the BSIZE field width
pub const MAX_BLOCK_SIZE: u64 = 65536;

/// Default logical read size for sequential streaming (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

const INDEX_HEADER_LEN: usize = 8;
const INDEX_ENTRY_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum BgzfError {
    #[error("Failed to fetch compressed data: {0}")]
    Fetch(#[from] FetchError),

    #[error("Failed to decompress BGZF blocks at compressed offset {offset}: {source}")]
    Decompress {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid BGZF block index: {0}")]
    InvalidIndex(String),
}

/// Start of one compressed block and the logical offset it decompresses to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub compressed_offset: u64,
    pub uncompressed_offset: u64,
}

/// Compressed span that must be fetched to serve a logical range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub compressed_start: u64,
    /// None when the range runs past the last indexed block
    pub compressed_end: Option<u64>,
    /// Logical offset of the first byte produced by decompressing the span
    pub uncompressed_start: u64,
}

/// Parsed `.gzi` index, with the implicit first block prepended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    entries: Vec<BlockEntry>,
}

fn read_u64_le(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Uncompressed offset of the last indexed block, read from the index trailer
pub fn index_tail(data: &[u8]) -> Option<u64> {
    if data.len() < INDEX_HEADER_LEN + INDEX_ENTRY_LEN {
        return None;
    }
    Some(read_u64_le(data, data.len() - 8))
}

impl BlockIndex {
    pub fn parse(data: &[u8]) -> Result<Self, BgzfError> {
        if data.len() < INDEX_HEADER_LEN {
            return Err(BgzfError::InvalidIndex(format!(
                "index is {} bytes, shorter than its header",
                data.len()
            )));
        }

        let count = read_u64_le(data, 0);
        let expected = count
            .checked_mul(INDEX_ENTRY_LEN as u64)
            .and_then(|n| n.checked_add(INDEX_HEADER_LEN as u64))
            .ok_or_else(|| BgzfError::InvalidIndex(format!("entry count {} overflows", count)))?;

        if (data.len() as u64) < expected {
            return Err(BgzfError::InvalidIndex(format!(
                "declares {} entries ({} bytes) but is {} bytes long",
                count,
                expected,
                data.len()
            )));
        }

        let mut entries = Vec::with_capacity(count as usize + 1);
        entries.push(BlockEntry {
            compressed_offset: 0,
            uncompressed_offset: 0,
        });
        for i in 0..count as usize {
            let base = INDEX_HEADER_LEN + i * INDEX_ENTRY_LEN;
            entries.push(BlockEntry {
                compressed_offset: read_u64_le(data, base),
                uncompressed_offset: read_u64_le(data, base + 8),
            });
        }

        let unsorted = entries.windows(2).any(|w| {
            w[1].compressed_offset < w[0].compressed_offset
                || w[1].uncompressed_offset < w[0].uncompressed_offset
        });
        if unsorted {
            return Err(BgzfError::InvalidIndex("entries are not in file order".to_string()));
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Uncompressed offset of the last indexed block start
    pub fn last_uncompressed_offset(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.uncompressed_offset)
    }

    /// Blocks covering the logical range `[offset, offset + length)`
    pub fn locate(&self, offset: u64, length: u64) -> BlockSpan {
        // entries[0] is (0, 0), so at least one entry is <= offset
        let first = self
            .entries
            .partition_point(|e| e.uncompressed_offset <= offset)
            .saturating_sub(1);
        let end = offset.saturating_add(length);
        let compressed_end = self.entries[first + 1..]
            .iter()
            .find(|e| e.uncompressed_offset >= end)
            .map(|e| e.compressed_offset);

        BlockSpan {
            compressed_start: self.entries[first].compressed_offset,
            compressed_end,
            uncompressed_start: self.entries[first].uncompressed_offset,
        }
    }
}

/// Decompress a run of whole BGZF blocks
fn inflate_blocks(data: Bytes) -> std::io::Result<Vec<u8>> {
    let mut reader = noodles_bgzf::io::Reader::new(Cursor::new(data));
    let mut decompressed = Vec::new();
    reader.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Logical reads over a BGZF resource and its `.gzi` companion
#[derive(Debug)]
pub struct BgzfFile {
    data: Arc<dyn RangeFetch>,
    index_source: Arc<dyn RangeFetch>,
    index: OnceCell<BlockIndex>,
}

impl BgzfFile {
    pub fn new(data: Arc<dyn RangeFetch>, index_source: Arc<dyn RangeFetch>) -> Self {
        Self {
            data,
            index_source,
            index: OnceCell::new(),
        }
    }

    /// Total decompressed size, or None when it cannot be discovered
    ///
    /// Probes the index trailer with a small range read first, then falls back
    /// to downloading the whole index. Never fails: an unknown total only
    /// degrades progress reporting.
    pub async fn total_size(&self) -> Option<u64> {
        if let Some(index) = self.index.get() {
            // A lone implicit entry says nothing about where the stream ends
            return (index.entries().len() > 1).then(|| index.last_uncompressed_offset());
        }

        match self.probe_index_tail().await {
            Ok(Some(size)) => return Some(size),
            Ok(None) => debug!("Index tail probe inconclusive, downloading whole index"),
            Err(e) => debug!("Index tail probe failed ({}), downloading whole index", e),
        }

        match self.index_source.read_file().await {
            Ok(body) => {
                let size = index_tail(&body);
                if size.is_none() {
                    warn!("Block index has no entries; total decompressed size unknown");
                }
                size
            }
            Err(e) => {
                warn!("Total decompressed size unknown ({}); progress will be indeterminate", e);
                None
            }
        }
    }

    async fn probe_index_tail(&self) -> Result<Option<u64>, FetchError> {
        let stat = self.index_source.stat().await?;
        let Some(size) = stat.known_size() else {
            return Ok(None);
        };
        if size < (INDEX_HEADER_LEN + INDEX_ENTRY_LEN) as u64 {
            return Ok(None);
        }

        let tail = self.index_source.read(8, size - 8).await?;
        if tail.len() != 8 {
            return Ok(None);
        }
        Ok(Some(read_u64_le(&tail, 0)))
    }

    /// Load the block index once
    pub async fn block_index(&self) -> Result<&BlockIndex, BgzfError> {
        self.index
            .get_or_try_init(|| async {
                let body = self.index_source.read_file().await?;
                let index = BlockIndex::parse(&body)?;
                info!("Loaded BGZF block index: {} blocks", index.entries().len());
                Ok(index)
            })
            .await
    }

    /// Read up to `length` decompressed bytes starting at logical `offset`
    ///
    /// Only the compressed blocks covering the range are fetched. Returns an
    /// empty buffer at end of stream.
    pub async fn read(&self, length: u64, offset: u64) -> Result<Bytes, BgzfError> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        let index = self.block_index().await?;
        let span = index.locate(offset, length);
        let compressed_end = span.compressed_end.unwrap_or_else(|| {
            // Past the last index entry only the final data block (and EOF marker) remain
            let last = index.entries().last().map_or(0, |e| e.compressed_offset);
            last.max(span.compressed_start) + 2 * MAX_BLOCK_SIZE
        });

        let compressed = self
            .data
            .read(compressed_end - span.compressed_start, span.compressed_start)
            .await?;
        if compressed.is_empty() {
            return Ok(Bytes::new());
        }

        let decompressed = inflate_blocks(compressed).map_err(|source| BgzfError::Decompress {
            offset: span.compressed_start,
            source,
        })?;

        let skip = (offset - span.uncompressed_start) as usize;
        if skip >= decompressed.len() {
            return Ok(Bytes::new());
        }
        let end = skip.saturating_add(length as usize).min(decompressed.len());
        Ok(Bytes::from(decompressed).slice(skip..end))
    }

    /// Sequential forward reader over fixed-size logical chunks
    pub fn into_chunks(self, chunk_size: u64) -> ChunkCursor {
        ChunkCursor {
            file: self,
            chunk_size: chunk_size.max(1),
            position: 0,
            exhausted: false,
        }
    }

    pub async fn close(&self) -> Result<(), FetchError> {
        self.data.close().await?;
        self.index_source.close().await
    }
}

/// Cursor advancing through a `BgzfFile` one logical chunk at a time
#[derive(Debug)]
pub struct ChunkCursor {
    file: BgzfFile,
    chunk_size: u64,
    position: u64,
    exhausted: bool,
}

impl ChunkCursor {
    /// Next chunk, or None at end of stream
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BgzfError> {
        if self.exhausted {
            return Ok(None);
        }

        let chunk = self.file.read(self.chunk_size, self.position).await?;
        if chunk.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        self.position += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Logical bytes consumed so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn file(&self) -> &BgzfFile {
        &self.file
    }
}
