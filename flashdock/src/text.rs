//! Text decoding and line-ending normalization.
//!
//! Shared by the tool output sinks and the serial monitor. Serial devices and
//! child processes both deliver bytes in arbitrary chunks, so decoding keeps
//! incomplete UTF-8 suffixes around for the next chunk.

use chrono::{DateTime, Local};

/// Timestamp layout used by the timestamped monitor mode.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('\u{FFFD}');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Decode whatever is left in `buffer`, replacing a dangling partial sequence.
pub fn finish_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let text = String::from_utf8_lossy(buffer).into_owned();
    buffer.clear();
    text
}

/// Raw monitor normalization: CRLF becomes LF, lone CR is dropped.
///
/// Dropping lone CRs instead of converting them keeps already-normalized logs
/// from turning double-spaced.
pub fn normalize_raw(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "")
}

/// Timestamped monitor normalization: CRLF and lone CR both become LF.
pub fn normalize_timestamped(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Format a timestamp prefix, e.g. `[2024-05-01 13:37:00.042] `.
pub fn timestamp_prefix(at: &DateTime<Local>) -> String {
    format!("[{}] ", at.format(TIMESTAMP_FORMAT))
}

/// Line assembler for the timestamped monitor mode.
///
/// Chunks are appended to an internal buffer and complete lines are handed
/// out with a timestamp prefix. A partial line stays buffered until its
/// newline arrives or [`TimestampedLines::finish`] is called.
#[derive(Debug, Default)]
pub struct TimestampedLines {
    buffer: String,
}

impl TimestampedLines {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk and return the display lines it completes.
    ///
    /// An empty line that ends the buffer is dropped; an empty line with more
    /// content behind it is kept as a bare `"\n"`.
    pub fn push(&mut self, chunk: &str, prefix: &str) -> Vec<String> {
        self.buffer.push_str(&normalize_timestamped(chunk));

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop();

            if line.is_empty() {
                if !self.buffer.is_empty() {
                    lines.push("\n".to_string());
                }
            } else {
                lines.push(format!("{prefix}{line}\n"));
            }
        }
        lines
    }

    /// Flush the pending partial line, prefixed, without a trailing newline.
    pub fn finish(&mut self, prefix: &str) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(format!("{prefix}{line}"))
    }

    /// Whether a partial line is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}
