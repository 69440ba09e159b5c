//! Incremental decoder for `data: {json}` event-stream bodies.
//!
//! Network reads split the body at arbitrary byte offsets, so the decoder keeps the
//! unterminated tail of the last read and completes it with the next one.

const DATA_PREFIX: &str = "data: ";

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// One complete line from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload after the `data: ` prefix.
    Data(String),
    /// Non-empty line without the data prefix (e.g. `event: ping`).
    Other(String),
    /// A line grew past the limit without a newline; this many bytes were dropped and the
    /// rest of the line is skipped.
    Overflow(usize),
}

/// Line splitter with carry-over between reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    /// Dropping the tail of an oversized line until its newline shows up.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
            discarding: false,
        }
    }

    /// Feed one read; returns every frame completed by it, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut input = bytes;
        if self.discarding {
            match input.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.discarding = false;
                    input = &input[i + 1..];
                }
                None => return frames,
            }
        }
        self.buffer.extend_from_slice(input);

        let mut start = 0;
        let mut from = self.scanned;
        while let Some(rel) = self.buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + rel;
            if let Some(frame) = decode_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            frames.push(Frame::Overflow(self.buffer.len()));
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        frames
    }

    /// Flush a final line the body did not terminate with a newline.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_line(&rest)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(bytes: &[u8]) -> Option<Frame> {
    let line = String::from_utf8_lossy(bytes);
    let line = line.strip_suffix('\r').unwrap_or(&line);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }
    match line.strip_prefix(DATA_PREFIX) {
        Some(data) => Some(Frame::Data(data.to_string())),
        None => Some(Frame::Other(line.to_string())),
    }
}
