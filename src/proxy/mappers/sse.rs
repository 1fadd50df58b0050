// SSE line reassembly
//
// Upstream bytes arrive in arbitrary chunk boundaries; this buffer splits out
// complete `\n`-terminated lines in order and keeps any partial tail. Shared
// by the streaming translator and the non-streaming collector so both paths
// parse identically.

use bytes::BytesMut;
use tracing::warn;

/// Hard cap before the buffer resynchronizes on the last newline.
const MAX_LINE_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it unlocks.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        // Overflow safeguard: a stream that never sends '\n' must not grow
        // unbounded. Discard up to the last newline in the first half; the
        // suffix stays intact so the stream can resynchronize.
        if self.buf.len() > MAX_LINE_BUFFER && !self.buf.contains(&b'\n') {
            warn!("SSE line buffer overflow ({} bytes), resyncing", self.buf.len());
            let half = self.buf.len() / 2;
            let cut = self.buf[..half]
                .iter()
                .rposition(|&b| b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(half);
            let _ = self.buf.split_to(cut);
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]).into_owned();
            lines.push(line);
        }
        lines
    }

    /// Hand back the partial tail, if any, for the EOF path where the last
    /// line arrives without a terminator.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Extract the payload of a `data: ` line, trimmed. Non-data lines yield
/// `None` and are ignored by both consumers.
pub fn data_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    let payload = line.strip_prefix("data: ")?;
    Some(payload.trim())
}
