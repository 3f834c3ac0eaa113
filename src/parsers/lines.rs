// ==============================================================================
// parsers/lines.rs - Incremental Line Decoder
// ==============================================================================
// Description: Splits an ordered byte-chunk stream into complete text lines
// Author: Matt Barham
// Created: 2026-09-30
// Modified: 2026-10-02
// Version: 1.0.0
// ==============================================================================

/// Turns arbitrarily chunked bytes into complete lines, in order, exactly once
///
/// Partial trailing bytes are carried into the next `push`. Lines starting
/// with the comment marker are dropped before reaching the caller.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    pending: Vec<u8>,
    comment_marker: Option<u8>,
    comments_dropped: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Decoder that drops `#` comment and directive lines
    pub fn new() -> Self {
        Self::with_comment_marker(Some(b'#'))
    }

    pub fn with_comment_marker(comment_marker: Option<u8>) -> Self {
        Self {
            pending: Vec::new(),
            comment_marker,
            comments_dropped: 0,
        }
    }

    /// Feed the next chunk; returns every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(pos) = chunk[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            if self.pending.is_empty() {
                self.emit(&chunk[start..end], &mut lines);
            } else {
                self.pending.extend_from_slice(&chunk[start..end]);
                let line = std::mem::take(&mut self.pending);
                self.emit(&line, &mut lines);
            }
            start = end + 1;
        }

        self.pending.extend_from_slice(&chunk[start..]);
        lines
    }

    /// End of stream: emit the trailing unterminated line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(1);
        self.emit(&line, &mut out);
        out.pop()
    }

    /// Bytes held back waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn comments_dropped(&self) -> usize {
        self.comments_dropped
    }

    fn emit(&mut self, line: &[u8], out: &mut Vec<String>) {
        if let (Some(marker), Some(&first)) = (self.comment_marker, line.first()) {
            if first == marker {
                self.comments_dropped += 1;
                return;
            }
        }
        out.push(String::from_utf8_lossy(line).into_owned());
    }
}
