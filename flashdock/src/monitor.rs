//! Serial monitor reader.
//!
//! A worker thread opens the device, reads whatever is available with a
//! short timeout, normalizes line endings for the selected display mode and
//! posts the text to the message queue.
//!
//! ```text
//! Idle -> Opening -> Streaming -> Stopping -> Stopped
//!            |                                  ^
//!            +---------- open failure ----------+
//! ```
//!
//! Stopping is cooperative: the stop flag is checked at the top of every
//! iteration, and a read returns at least once per timeout.

use std::io::{self, Read as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::error::Result;
use crate::message::{Message, MessageSender};
use crate::port::SerialOpener;
use crate::text::{
    TimestampedLines, drain_utf8_lossy, finish_utf8_lossy, normalize_raw, timestamp_prefix,
};
use crate::tool::panic_message;

const READ_CHUNK: usize = 1024;

/// How monitor output is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MonitorMode {
    /// Chunks are shown as received.
    #[default]
    Raw,
    /// Complete lines are shown with a local timestamp prefix.
    Timestamped,
}

impl MonitorMode {
    /// Mode for a "show timestamps" toggle.
    pub fn from_timestamps(enabled: bool) -> Self {
        if enabled { Self::Timestamped } else { Self::Raw }
    }
}

/// Lifecycle of a monitor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    /// Not started.
    #[default]
    Idle,
    /// Opening the device.
    Opening,
    /// Reading from the device.
    Streaming,
    /// Stop requested or read failed; cleaning up.
    Stopping,
    /// Device closed, `MonitorDone` posted.
    Stopped,
}

/// Settings for one monitor session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Device identifier.
    pub device: String,
    /// Baud rate.
    pub baud: u32,
    /// Display mode.
    pub mode: MonitorMode,
}

/// Turns raw device bytes into display messages for one display mode.
#[derive(Debug)]
pub struct MonitorDecoder {
    mode: MonitorMode,
    utf8: Vec<u8>,
    lines: TimestampedLines,
}

impl MonitorDecoder {
    /// Create a decoder with empty buffers.
    pub fn new(mode: MonitorMode) -> Self {
        Self {
            mode,
            utf8: Vec::new(),
            lines: TimestampedLines::new(),
        }
    }

    /// Decode a chunk received at `now`.
    pub fn feed(&mut self, bytes: &[u8], now: &DateTime<Local>) -> Vec<Message> {
        self.utf8.extend_from_slice(bytes);
        let text = drain_utf8_lossy(&mut self.utf8);
        self.feed_text(&text, now)
    }

    fn feed_text(&mut self, text: &str, now: &DateTime<Local>) -> Vec<Message> {
        if text.is_empty() {
            return Vec::new();
        }
        match self.mode {
            MonitorMode::Raw => {
                let shown = normalize_raw(text);
                if shown.is_empty() {
                    Vec::new()
                } else {
                    vec![Message::stdout(shown)]
                }
            },
            MonitorMode::Timestamped => {
                let prefix = timestamp_prefix(now);
                self.lines
                    .push(text, &prefix)
                    .into_iter()
                    .map(Message::stdout)
                    .collect()
            },
        }
    }

    /// Flush everything still buffered. The last partial line keeps no
    /// trailing newline.
    pub fn finish(&mut self, now: &DateTime<Local>) -> Vec<Message> {
        let mut out = Vec::new();
        if !self.utf8.is_empty() {
            let tail = finish_utf8_lossy(&mut self.utf8);
            out = self.feed_text(&tail, now);
        }
        if let Some(line) = self.lines.finish(&timestamp_prefix(now)) {
            out.push(Message::stdout(line));
        }
        out
    }
}

#[derive(Debug, Default)]
struct SharedState(Mutex<MonitorState>);

impl SharedState {
    fn set(&self, state: MonitorState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn get(&self) -> MonitorState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_idle_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn run_monitor(
    opener: &dyn SerialOpener,
    config: &MonitorConfig,
    stop: &AtomicBool,
    state: &SharedState,
    tx: &MessageSender,
) {
    state.set(MonitorState::Opening);

    let mut device = match opener.open(&config.device, config.baud) {
        Ok(device) => device,
        Err(e) => {
            warn!("Monitor failed to open {}: {e}", config.device);
            tx.send(Message::stderr(format!(
                "\n[Monitor] failed to open {}: {e}\n",
                config.device
            )));
            state.set(MonitorState::Stopped);
            tx.send(Message::monitor_done());
            return;
        },
    };

    state.set(MonitorState::Streaming);
    info!("Monitoring {} at {} baud", config.device, config.baud);
    tx.send(Message::stdout(format!(
        "\n=== MONITOR: {} @ {} ===\n",
        config.device, config.baud
    )));

    let mut decoder = MonitorDecoder::new(config.mode);
    let mut buf = [0u8; READ_CHUNK];

    // A panic still ends in the stop banner and `MonitorDone`.
    let streamed = panic::catch_unwind(AssertUnwindSafe(|| {
        while !stop.load(Ordering::Relaxed) {
            match device.read(&mut buf) {
                Ok(0) => thread::sleep(Duration::from_millis(10)),
                Ok(n) => {
                    for message in decoder.feed(&buf[..n], &Local::now()) {
                        tx.send(message);
                    }
                },
                Err(ref e) if is_idle_read(e) => {},
                Err(e) => {
                    warn!("Monitor read error on {}: {e}", config.device);
                    tx.send(Message::stderr(format!("\n[Monitor] read error: {e}\n")));
                    break;
                },
            }
        }
    }));
    if let Err(payload) = streamed {
        let reason = panic_message(payload.as_ref());
        warn!("Monitor on {} panicked: {reason}", config.device);
        tx.send(Message::stderr(format!("\n[Monitor] {reason}\n")));
    }

    state.set(MonitorState::Stopping);
    for message in decoder.finish(&Local::now()) {
        tx.send(message);
    }
    drop(device);
    debug!("Closed {}", config.device);

    tx.send(Message::stdout("\n=== MONITOR STOPPED ===\n"));
    state.set(MonitorState::Stopped);
    tx.send(Message::monitor_done());
}

/// Handle to a running monitor thread.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    state: Arc<SharedState>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Start a monitor session on a worker thread.
    pub fn spawn(
        opener: Arc<dyn SerialOpener>,
        config: MonitorConfig,
        tx: MessageSender,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(SharedState::default());

        let thread = {
            let stop = Arc::clone(&stop);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("flashdock-monitor".to_string())
                .spawn(move || run_monitor(opener.as_ref(), &config, &stop, &state, &tx))?
        };

        Ok(Self {
            stop,
            state,
            thread: Some(thread),
        })
    }

    /// Ask the reader to stop. Returns immediately.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Current session state.
    pub fn state(&self) -> MonitorState {
        self.state.get()
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request a stop and wait for the worker to exit.
    pub fn stop_and_join(mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted serial devices.

    use super::*;
    use crate::port::SerialHandle;
    use std::collections::VecDeque;

    /// One scripted read result.
    #[derive(Debug)]
    pub enum Step {
        Data(Vec<u8>),
        Error(io::ErrorKind),
        Panic(&'static str),
    }

    /// A device that replays steps, then times out forever.
    pub struct ScriptedDevice {
        steps: VecDeque<Step>,
        closed: Arc<AtomicBool>,
    }

    impl io::Read for ScriptedDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Step::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                },
                Some(Step::Error(kind)) => Err(io::Error::new(kind, "scripted failure")),
                Some(Step::Panic(reason)) => panic!("{reason}"),
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Err(io::ErrorKind::TimedOut.into())
                },
            }
        }
    }

    impl Drop for ScriptedDevice {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Opener handing out one scripted device per call.
    pub struct ScriptedOpener {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        pub closed: Arc<AtomicBool>,
        pub fail: bool,
        pub panic_on_open: bool,
    }

    impl ScriptedOpener {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                scripts: Mutex::new(VecDeque::from([steps])),
                closed: Arc::new(AtomicBool::new(false)),
                fail: false,
                panic_on_open: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }

        pub fn panicking() -> Self {
            Self {
                panic_on_open: true,
                ..Self::new(Vec::new())
            }
        }
    }

    impl SerialOpener for ScriptedOpener {
        fn open(&self, device: &str, _baud: u32) -> Result<SerialHandle> {
            assert!(!self.panic_on_open, "driver fault opening {device}");
            if self.fail {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such device {device}"),
                )
                .into());
            }
            let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedDevice {
                steps: steps.into(),
                closed: Arc::clone(&self.closed),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedOpener, Step};
    use super::*;
    use crate::message::{MessageKind, MessageQueue};
    use chrono::TimeZone;
    use std::time::Instant;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 13, 37, 0).unwrap()
    }

    fn config(mode: MonitorMode) -> MonitorConfig {
        MonitorConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            mode,
        }
    }

    fn wait_for_done(queue: &MessageQueue) -> Vec<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut all = Vec::new();
        while Instant::now() < deadline {
            all.extend(queue.drain());
            if all.iter().any(|m| m.kind() == MessageKind::MonitorDone) {
                return all;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("monitor did not finish: {all:?}");
    }

    #[test]
    fn test_raw_decoder_normalizes_line_endings() {
        let mut decoder = MonitorDecoder::new(MonitorMode::Raw);
        let out = decoder.feed(b"abc\r\ndef\r", &fixed_time());
        assert_eq!(out, vec![Message::stdout("abc\ndef")]);
        assert!(decoder.finish(&fixed_time()).is_empty());
    }

    #[test]
    fn test_raw_decoder_drops_cr_only_chunk() {
        let mut decoder = MonitorDecoder::new(MonitorMode::Raw);
        assert!(decoder.feed(b"\r", &fixed_time()).is_empty());
    }

    #[test]
    fn test_timestamped_decoder_posts_two_prefixed_lines() {
        let mut decoder = MonitorDecoder::new(MonitorMode::Timestamped);
        let mut out = decoder.feed(b"abc\r\ndef\r", &fixed_time());
        out.extend(decoder.finish(&fixed_time()));
        assert_eq!(
            out,
            vec![
                Message::stdout("[2024-05-01 13:37:00.000] abc\n"),
                Message::stdout("[2024-05-01 13:37:00.000] def\n"),
            ]
        );
    }

    #[test]
    fn test_timestamped_decoder_flushes_partial_without_newline() {
        let mut decoder = MonitorDecoder::new(MonitorMode::Timestamped);
        assert!(decoder.feed(b"boot: ", &fixed_time()).is_empty());
        let out = decoder.finish(&fixed_time());
        assert_eq!(out, vec![Message::stdout("[2024-05-01 13:37:00.000] boot: ")]);
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = MonitorDecoder::new(MonitorMode::Raw);
        let out = decoder.feed(&[b'o', 0xFF, b'k'], &fixed_time());
        assert_eq!(out, vec![Message::stdout("o\u{FFFD}k")]);
    }

    #[test]
    fn test_decoder_joins_utf8_split_across_reads() {
        let mut decoder = MonitorDecoder::new(MonitorMode::Raw);
        let bytes = "é".as_bytes();
        assert!(decoder.feed(&bytes[..1], &fixed_time()).is_empty());
        assert_eq!(
            decoder.feed(&bytes[1..], &fixed_time()),
            vec![Message::stdout("é")]
        );
    }

    #[test]
    fn test_session_streams_until_stopped() {
        let queue = MessageQueue::new();
        let opener = Arc::new(ScriptedOpener::new(vec![
            Step::Data(b"hello\r\n".to_vec()),
            Step::Data(b"world".to_vec()),
        ]));
        let closed = Arc::clone(&opener.closed);
        let handle =
            MonitorHandle::spawn(opener, config(MonitorMode::Raw), queue.sender()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while !seen.contains(&Message::stdout("world")) && Instant::now() < deadline {
            seen.extend(queue.drain());
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), MonitorState::Streaming);

        handle.request_stop();
        seen.extend(wait_for_done(&queue));

        assert_eq!(
            seen,
            vec![
                Message::stdout("\n=== MONITOR: /dev/ttyUSB0 @ 115200 ===\n"),
                Message::stdout("hello\n"),
                Message::stdout("world"),
                Message::stdout("\n=== MONITOR STOPPED ===\n"),
                Message::monitor_done(),
            ]
        );
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(handle.state(), MonitorState::Stopped);
        handle.stop_and_join();
    }

    #[test]
    fn test_session_flushes_timestamped_partial_on_stop() {
        let queue = MessageQueue::new();
        let opener = Arc::new(ScriptedOpener::new(vec![Step::Data(b"line\npartial".to_vec())]));
        let handle =
            MonitorHandle::spawn(opener, config(MonitorMode::Timestamped), queue.sender())
                .unwrap();

        thread::sleep(Duration::from_millis(50));
        handle.request_stop();
        let messages = wait_for_done(&queue);

        let texts: Vec<&str> = messages.iter().map(Message::payload).collect();
        assert!(texts[1].starts_with('[') && texts[1].ends_with("] line\n"));
        assert!(texts[2].starts_with('[') && texts[2].ends_with("] partial"));
        assert_eq!(texts[3], "\n=== MONITOR STOPPED ===\n");
        handle.stop_and_join();
    }

    #[test]
    fn test_read_error_stops_session() {
        let queue = MessageQueue::new();
        let opener = Arc::new(ScriptedOpener::new(vec![
            Step::Data(b"x".to_vec()),
            Step::Error(io::ErrorKind::BrokenPipe),
        ]));
        let closed = Arc::clone(&opener.closed);
        let handle =
            MonitorHandle::spawn(opener, config(MonitorMode::Raw), queue.sender()).unwrap();

        let messages = wait_for_done(&queue);
        assert_eq!(messages[1], Message::stdout("x"));
        assert_eq!(messages[2].kind(), MessageKind::ErrorOutput);
        assert!(messages[2].payload().starts_with("\n[Monitor] read error:"));
        assert_eq!(messages[3], Message::stdout("\n=== MONITOR STOPPED ===\n"));
        assert_eq!(messages[4], Message::monitor_done());
        assert!(closed.load(Ordering::SeqCst));
        assert!(!handle.stop_requested());
        handle.stop_and_join();
    }

    #[test]
    fn test_device_panic_still_reports_done() {
        let queue = MessageQueue::new();
        let opener = Arc::new(ScriptedOpener::new(vec![
            Step::Data(b"boot\n".to_vec()),
            Step::Panic("driver fault"),
        ]));
        let closed = Arc::clone(&opener.closed);
        let handle =
            MonitorHandle::spawn(opener, config(MonitorMode::Raw), queue.sender()).unwrap();

        let messages = wait_for_done(&queue);
        assert_eq!(
            messages,
            vec![
                Message::stdout("\n=== MONITOR: /dev/ttyUSB0 @ 115200 ===\n"),
                Message::stdout("boot\n"),
                Message::stderr("\n[Monitor] driver fault\n"),
                Message::stdout("\n=== MONITOR STOPPED ===\n"),
                Message::monitor_done(),
            ]
        );
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(handle.state(), MonitorState::Stopped);
        handle.stop_and_join();
    }

    #[test]
    fn test_open_failure_skips_streaming() {
        let queue = MessageQueue::new();
        let opener = Arc::new(ScriptedOpener::failing());
        let handle =
            MonitorHandle::spawn(opener, config(MonitorMode::Raw), queue.sender()).unwrap();

        let messages = wait_for_done(&queue);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind(), MessageKind::ErrorOutput);
        assert!(messages[0]
            .payload()
            .starts_with("\n[Monitor] failed to open /dev/ttyUSB0"));
        assert_eq!(messages[1], Message::monitor_done());
        assert_eq!(handle.state(), MonitorState::Stopped);
        handle.stop_and_join();
    }

    #[test]
    fn test_monitor_mode_from_timestamps() {
        assert_eq!(MonitorMode::from_timestamps(true), MonitorMode::Timestamped);
        assert_eq!(MonitorMode::from_timestamps(false), MonitorMode::Raw);
    }
}
