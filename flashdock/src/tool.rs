//! Tool runner: executes the flashing tool on a worker thread and streams its
//! output to the message queue.
//!
//! The working directory and argument vector are attached to the tool
//! invocation itself, so nothing process-wide is changed and nothing needs
//! restoring when the tool fails. A process-wide lock still serializes
//! invocations, since the tool owns the serial port while it runs.

use std::ffi::OsString;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::args::ToolInvocation;
use crate::error::{Error, Result};
use crate::message::{Message, MessageSender};
use crate::sink::LineSink;

static TOOL_LOCK: Mutex<()> = Mutex::new(());

/// A flashing tool that can be run to completion.
pub trait FlashTool: Send + Sync {
    /// Run the tool with `argv` (program name first) inside `working_dir`,
    /// writing its output to the two sinks. Returns the exit code.
    fn run(
        &self,
        argv: &[String],
        working_dir: &Path,
        stdout: &mut LineSink,
        stderr: &mut LineSink,
    ) -> Result<i32>;

    /// Name used in exit-code messages.
    fn name(&self) -> &str {
        crate::args::TOOL_PROGRAM
    }
}

/// The flashing tool as an external program.
///
/// `command` replaces `argv[0]`: it is the program followed by any fixed
/// leading arguments, e.g. `["python", "-m", "esptool"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    command: Vec<OsString>,
}

impl ExternalTool {
    /// Use an explicit command. An empty command falls back to [`ExternalTool::locate`].
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let command: Vec<OsString> = command.into_iter().map(Into::into).collect();
        if command.is_empty() {
            return Self::locate();
        }
        Self { command }
    }

    /// Parse a command line such as `python -m esptool`.
    ///
    /// A line naming an existing file is used as the program as is. Otherwise
    /// words are split on whitespace, and single or double quotes group a
    /// path containing spaces: `"C:\Program Files\Python\python.exe" -m esptool`.
    /// Backslashes are literal.
    pub fn from_command_line(line: &str) -> Self {
        let line = line.trim();
        if Path::new(line).is_file() {
            return Self::new([line]);
        }
        Self::new(split_command_line(line))
    }

    /// Find the tool on `PATH`, falling back to running it as a Python module.
    pub fn locate() -> Self {
        for candidate in ["esptool", "esptool.py"] {
            if let Ok(path) = which::which(candidate) {
                debug!("Found {candidate} at {}", path.display());
                return Self {
                    command: vec![path.into_os_string()],
                };
            }
        }

        let python = if cfg!(windows) { "python" } else { "python3" };
        debug!("esptool not on PATH, using {python} -m esptool");
        Self {
            command: vec![python.into(), "-m".into(), "esptool".into()],
        }
    }

    /// The program and its fixed leading arguments.
    pub fn command(&self) -> &[OsString] {
        &self.command
    }

    fn to_command(&self, argv: &[String], working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .args(argv.iter().skip(1))
            .current_dir(working_dir)
            // Python buffers stdout when it is a pipe; progress must stream live.
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Default for ExternalTool {
    fn default() -> Self {
        Self::locate()
    }
}

impl FlashTool for ExternalTool {
    fn run(
        &self,
        argv: &[String],
        working_dir: &Path,
        stdout: &mut LineSink,
        stderr: &mut LineSink,
    ) -> Result<i32> {
        let mut child = self.to_command(argv, working_dir).spawn().map_err(|e| {
            Error::ToolFailed(format!(
                "failed to start {}: {e}",
                PathBuf::from(&self.command[0]).display()
            ))
        })?;

        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| Error::ToolFailed("stdout not captured".to_string()))?;
        let mut child_err = child
            .stderr
            .take()
            .ok_or_else(|| Error::ToolFailed("stderr not captured".to_string()))?;

        let copied = thread::scope(|s| {
            let err_pump = s.spawn(|| io::copy(&mut child_err, stderr));
            let out = io::copy(&mut child_out, stdout);
            let err = err_pump
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stderr reader panicked")));
            out.and(err)
        });

        let status = child.wait()?;
        copied?;
        Ok(exit_code(status))
    }
}

fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => word.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            },
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            },
            None => {
                word.push(c);
                in_word = true;
            },
        }
    }
    if in_word {
        words.push(word);
    }
    words
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `tool` to completion on the current thread.
///
/// Never fails: a non-zero exit, a start failure or a panic inside the tool
/// become error-kind messages. Both sinks are flushed and `ToolDone` is
/// always posted last.
pub fn run_tool(tool: &dyn FlashTool, invocation: &ToolInvocation, tx: &MessageSender) {
    let _guard = TOOL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    info!(
        "Running {} in {}",
        invocation.argv.join(" "),
        invocation.working_dir.display()
    );

    let mut out = LineSink::stdout(tx.clone());
    let mut err = LineSink::stderr(tx.clone());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        tool.run(&invocation.argv, &invocation.working_dir, &mut out, &mut err)
    }));

    out.flush_line();
    err.flush_line();

    let (summary, line) = match outcome {
        Ok(Ok(0)) => {
            debug!("{} finished successfully", tool.name());
            tx.send(Message::tool_done());
            return;
        },
        Ok(Ok(code)) => {
            let summary = format!("{} exited with code {code}", tool.name());
            let line = format!("\n[{summary}]\n");
            (summary, line)
        },
        Ok(Err(e)) => {
            let summary = e.to_string();
            let line = format!("\n[Exception] {summary}\n");
            (summary, line)
        },
        Err(payload) => {
            let summary = panic_message(payload.as_ref());
            let line = format!("\n[Exception] {summary}\n");
            (summary, line)
        },
    };

    warn!("{summary}");
    tx.send(Message::stderr(line));
    tx.send(Message::tool_failed(summary));
}

/// Run `tool` on a dedicated worker thread.
pub fn spawn_tool(
    tool: Arc<dyn FlashTool>,
    invocation: ToolInvocation,
    tx: MessageSender,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("flashdock-tool".to_string())
        .spawn(move || run_tool(tool.as_ref(), &invocation, &tx))?;
    Ok(handle)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted tools for exercising the runner without hardware.

    use super::*;
    use std::sync::Mutex;

    /// What a [`ScriptedTool`] does when run.
    #[derive(Debug, Clone)]
    pub enum Behavior {
        /// Write the given chunks and exit with a code.
        Exit(i32),
        /// Write the chunks, then fail with an error.
        Fail(String),
        /// Write the chunks, then panic.
        Panic(String),
    }

    /// A tool that replays scripted output.
    #[derive(Debug)]
    pub struct ScriptedTool {
        pub stdout: Vec<String>,
        pub stderr: Vec<String>,
        pub behavior: Behavior,
        pub calls: Mutex<Vec<(Vec<String>, PathBuf)>>,
    }

    impl ScriptedTool {
        pub fn new(stdout: &[&str], stderr: &[&str], behavior: Behavior) -> Self {
            Self {
                stdout: stdout.iter().map(ToString::to_string).collect(),
                stderr: stderr.iter().map(ToString::to_string).collect(),
                behavior,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(stdout: &[&str]) -> Self {
            Self::new(stdout, &[], Behavior::Exit(0))
        }
    }

    impl FlashTool for ScriptedTool {
        fn run(
            &self,
            argv: &[String],
            working_dir: &Path,
            stdout: &mut LineSink,
            stderr: &mut LineSink,
        ) -> Result<i32> {
            self.calls
                .lock()
                .unwrap()
                .push((argv.to_vec(), working_dir.to_path_buf()));
            for chunk in &self.stdout {
                stdout.write_str(chunk);
            }
            for chunk in &self.stderr {
                stderr.write_str(chunk);
            }
            match &self.behavior {
                Behavior::Exit(code) => Ok(*code),
                Behavior::Fail(msg) => Err(Error::ToolFailed(msg.clone())),
                Behavior::Panic(msg) => panic!("{msg}"),
            }
        }
    }
}
