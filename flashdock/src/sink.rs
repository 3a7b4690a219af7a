//! Line-buffering output sink.
//!
//! Tools print progress in arbitrary fragments. [`LineSink`] accumulates
//! them and posts one message per complete line, so the log view never sees
//! half-written lines. Carriage returns count as line breaks, which turns
//! progress-bar overwrites into separate lines.

use std::io;

use crate::message::{Message, MessageKind, MessageSender};
use crate::text::{drain_utf8_lossy, finish_utf8_lossy};

/// Output stream adapter that posts complete lines to the message queue.
#[derive(Debug)]
pub struct LineSink {
    kind: MessageKind,
    tx: MessageSender,
    line: String,
    pending_bytes: Vec<u8>,
}

impl LineSink {
    /// Create a sink that tags every line with `kind`.
    pub fn new(kind: MessageKind, tx: MessageSender) -> Self {
        Self {
            kind,
            tx,
            line: String::new(),
            pending_bytes: Vec::new(),
        }
    }

    /// Sink for standard output.
    pub fn stdout(tx: MessageSender) -> Self {
        Self::new(MessageKind::StandardOutput, tx)
    }

    /// Sink for standard error.
    pub fn stderr(tx: MessageSender) -> Self {
        Self::new(MessageKind::ErrorOutput, tx)
    }

    /// The stream kind this sink tags lines with.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Accept a text chunk. Always takes the whole chunk and returns its
    /// length in characters.
    pub fn write_str(&mut self, chunk: &str) -> usize {
        if chunk.is_empty() {
            return 0;
        }

        self.line.push_str(&chunk.replace('\r', "\n"));

        while let Some(pos) = self.line.find('\n') {
            let rest = self.line.split_off(pos + 1);
            let complete = std::mem::replace(&mut self.line, rest);
            self.tx.send(Message::new(self.kind, complete));
        }

        chunk.chars().count()
    }

    /// Post the buffered partial line, if any, without adding a newline.
    pub fn flush_line(&mut self) {
        if !self.pending_bytes.is_empty() {
            let tail = finish_utf8_lossy(&mut self.pending_bytes);
            self.write_str(&tail);
        }
        if !self.line.is_empty() {
            let rest = std::mem::take(&mut self.line);
            self.tx.send(Message::new(self.kind, rest));
        }
    }
}

impl io::Write for LineSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending_bytes.extend_from_slice(buf);
        let text = drain_utf8_lossy(&mut self.pending_bytes);
        self.write_str(&text);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_line();
        Ok(())
    }
}
