//! Incremental line decoder for streamed command output
//!
//! Bytes are split on `\n` only. A `\r` stays in the line exactly as the
//! remote sent it.

/// Folds arbitrarily chunked bytes into complete lines.
#[derive(Debug, Default)]
pub struct LineStreamDecoder {
    /// Unterminated tail of everything fed so far
    tail: Vec<u8>,
}

impl LineStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completes, without the `\n`.
    ///
    /// Lines are decoded as UTF-8 lossily once complete, so a multi-byte
    /// character split across chunks still decodes correctly.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.tail.extend_from_slice(&rest[..pos]);
            lines.push(String::from_utf8_lossy(&self.tail).into_owned());
            self.tail.clear();
            rest = &rest[pos + 1..];
        }
        self.tail.extend_from_slice(rest);
        lines
    }

    /// Take the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.tail.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.tail).into_owned();
        self.tail.clear();
        Some(line)
    }

    pub fn pending(&self) -> &[u8] {
        &self.tail
    }
}
