//! Newline-delimited JSON framing.
//!
//! Children write one JSON object per line on stdout. Chunks arrive at
//! arbitrary boundaries, so partial lines are buffered until their newline
//! shows up. Lines that are not valid JSON are dropped.

use serde_json::Value;

/// Default cap on a single buffered line (16 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Incremental decoder from a byte stream to JSON values.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default line cap.
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a decoder that drops any line longer than `max_line_bytes`.
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed a chunk and return every complete JSON value it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(line);
            if let Some(value) = parse_line(&self.buf) {
                out.push(value);
            }
            self.buf.clear();
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_line_bytes {
                tracing::warn!(
                    buffered = self.buf.len(),
                    limit = self.max_line_bytes,
                    "dropping oversized line from child stdout"
                );
                self.buf.clear();
                self.discarding = true;
            }
        }

        out
    }

    /// Bytes currently held waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Flush whatever is buffered at end-of-stream.
    pub fn finish(&mut self) -> Option<Value> {
        let value = if self.discarding {
            None
        } else {
            parse_line(&self.buf)
        };
        self.buf.clear();
        self.discarding = false;
        value
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace())?;
    serde_json::from_slice(&line[start..=end]).ok()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
