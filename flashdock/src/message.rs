//! Messages passed from worker threads to the control loop.
//!
//! Workers never touch session state. They post immutable [`Message`]s on an
//! unbounded FIFO channel, and the control loop drains the channel once per
//! tick.

use crossbeam_channel::{Receiver, Sender};

/// Kind tag of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Text written to standard output (tool output, monitor data, banners).
    StandardOutput,
    /// Text written to standard error (tool errors, monitor failures).
    ErrorOutput,
    /// The tool runner finished. Always the last message of a run.
    ToolDone,
    /// The serial monitor released the port. Always the last message of a session.
    MonitorDone,
}

/// A tagged unit of text or lifecycle signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: String,
}

impl Message {
    /// Create a message.
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Standard output text.
    pub fn stdout(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::StandardOutput, payload)
    }

    /// Error output text.
    pub fn stderr(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::ErrorOutput, payload)
    }

    /// Tool completion marker for a successful run.
    pub fn tool_done() -> Self {
        Self::new(MessageKind::ToolDone, "")
    }

    /// Tool completion marker for a failed run, carrying a short summary.
    pub fn tool_failed(summary: impl Into<String>) -> Self {
        Self::new(MessageKind::ToolDone, summary)
    }

    /// Monitor completion marker.
    pub fn monitor_done() -> Self {
        Self::new(MessageKind::MonitorDone, "")
    }

    /// The kind tag.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The text payload.
    ///
    /// Empty for `MonitorDone` and for a successful `ToolDone`; a failed
    /// `ToolDone` carries its failure summary.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Cloneable producer side of the message queue.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: Sender<Message>,
}

impl MessageSender {
    /// Post a message.
    ///
    /// A closed queue means the control loop is gone; the message is dropped.
    pub fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            log::trace!("message queue closed, dropping message");
        }
    }
}

/// Consumer side of the message queue, owned by the control loop.
#[derive(Debug)]
pub struct MessageQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    /// Create an empty unbounded queue.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// A new producer handle for a worker thread.
    pub fn sender(&self) -> MessageSender {
        MessageSender {
            tx: self.tx.clone(),
        }
    }

    /// Take every message currently pending, in FIFO order, without blocking.
    ///
    /// Messages posted while draining are left for the next call.
    pub fn drain(&self) -> Vec<Message> {
        let pending = self.rx.len();
        self.rx.try_iter().take(pending).collect()
    }

    /// Whether no messages are pending.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
