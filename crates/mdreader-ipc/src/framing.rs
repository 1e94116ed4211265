//! Newline framing for inbound byte streams.

/// Longest line a framer accepts by default.
pub const DEFAULT_MAX_LINE: usize = 16 * 1024 * 1024;

/// Reassembles newline-delimited lines from arbitrarily chunked input.
///
/// Bytes after the last `\n` stay buffered until a later chunk completes
/// the line. A `\r` directly before the terminator is stripped and blank
/// lines are skipped. A line longer than the limit is dropped whole, up to
/// and including its terminator, so the buffer stays bounded.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line: usize,
    /// Inside an oversized line whose head was already dropped.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create an empty framer with the default line limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    /// Create an empty framer that drops lines longer than `max_line` bytes.
    #[must_use]
    pub const fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Append a chunk and return every line it completes, in order.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();

        if self.discarding {
            let Some(end) = chunk.iter().position(|&b| b == b'\n') else {
                return lines;
            };
            self.discarding = false;
            chunk = &chunk[end + 1..];
        }

        // Bytes already buffered contain no terminator.
        let mut scan_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        let mut line_start = 0;

        while let Some(offset) = self.buffer[scan_from..].iter().position(|&b| b == b'\n') {
            let end = scan_from + offset;
            let mut line = &self.buffer[line_start..end];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            if line.len() > self.max_line {
                tracing::warn!(len = line.len(), max = self.max_line, "Dropping oversized line");
            } else if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line.to_vec());
            }
            line_start = end + 1;
            scan_from = line_start;
        }

        self.buffer.drain(..line_start);

        if self.buffer.len() > self.max_line {
            tracing::warn!(
                len = self.buffer.len(),
                max = self.max_line,
                "Dropping oversized line before its terminator"
            );
            self.buffer.clear();
            self.discarding = true;
        }

        lines
    }

    /// Number of buffered bytes belonging to an incomplete line.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}
