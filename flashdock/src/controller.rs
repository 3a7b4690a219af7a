//! Session controller shared by every front end.
//!
//! The controller owns the session settings, the log view and the message
//! queue. Front ends call its operations in response to user input and call
//! [`Controller::poll`] once per tick; worker threads only ever talk back
//! through the queue.
//!
//! The tool and the monitor never hold the device at the same time. Starting
//! a tool operation while the monitor runs asks the monitor to stop and parks
//! the tool job until `MonitorDone` is drained, so the monitor's last output
//! always lands in the log before the tool's first line.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::args::{
    Chip, DEFAULT_FLASH_BAUD, DEFAULT_MONITOR_BAUD, Operation, ToolInvocation, build_invocation,
    find_flash_args,
};
use crate::error::{Error, Result};
use crate::message::{MessageKind, MessageQueue};
use crate::monitor::{MonitorConfig, MonitorHandle, MonitorMode};
use crate::port::{self, PortDescriptor, SerialOpener};
use crate::tool::{FlashTool, spawn_tool};

/// Text shown in a fresh log view.
pub const INITIAL_LOG: &str =
    "Ready.\n1) Build the project (idf.py build)\n2) Select a port and run flash.\n";

type PortLister = Box<dyn Fn() -> Vec<PortDescriptor> + Send>;

/// A tool job waiting for the monitor to release the device.
#[derive(Debug)]
struct PendingJob {
    header: String,
    invocation: ToolInvocation,
}

/// User-facing status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing has happened yet.
    Ready,
    /// The last refresh found this many ports.
    FoundPorts(usize),
    /// The last refresh found nothing.
    NoPorts,
    /// A tool operation is queued or running.
    Working,
    /// The monitor is running.
    Monitoring,
    /// The last tool operation finished.
    Done,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            Self::FoundPorts(n) => write!(f, "Found {n} port(s)"),
            Self::NoPorts => f.write_str("No ports found"),
            Self::Working => f.write_str("Working…"),
            Self::Monitoring => f.write_str("Monitoring…"),
            Self::Done => f.write_str("Done"),
        }
    }
}

/// Which controls a front end should offer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    /// Port, chip, flash baud and project directory selection, plus refresh.
    pub selectors: bool,
    /// Flash, erase and read-mac.
    pub tool_actions: bool,
    /// The monitor start/stop toggle.
    pub monitor_toggle: bool,
    /// Monitor baud and timestamp settings.
    pub monitor_settings: bool,
}

/// How the last tool run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Exit code zero.
    Succeeded,
    /// Non-zero exit, start failure or crash, with a short summary.
    Failed(String),
}

/// What one call to [`Controller::poll`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollUpdate {
    /// Text appended to the log view, in order.
    pub appended: String,
    /// Set when a tool run completed during this poll.
    pub tool_outcome: Option<ToolOutcome>,
    /// Set when a monitor session ended during this poll.
    pub monitor_stopped: bool,
}

impl PollUpdate {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.appended.is_empty() && self.tool_outcome.is_none() && !self.monitor_stopped
    }
}

/// User-selected settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Project root or build folder holding `flash_args`.
    pub project_dir: PathBuf,
    /// Selected device, if any.
    pub port: Option<String>,
    /// Chip target.
    pub chip: Chip,
    /// Flashing baud rate; `None` lets the tool pick.
    pub flash_baud: Option<u32>,
    /// Monitor baud rate.
    pub monitor_baud: u32,
    /// Monitor display mode.
    pub monitor_mode: MonitorMode,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            port: None,
            chip: Chip::default(),
            flash_baud: Some(DEFAULT_FLASH_BAUD),
            monitor_baud: DEFAULT_MONITOR_BAUD,
            monitor_mode: MonitorMode::default(),
        }
    }
}

/// Append-only log text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogView {
    text: String,
}

impl Default for LogView {
    fn default() -> Self {
        Self {
            text: INITIAL_LOG.to_string(),
        }
    }
}

impl LogView {
    /// Append text.
    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// The full text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Drives the tool runner and the monitor for one user session.
pub struct Controller {
    session: Session,
    ports: Vec<PortDescriptor>,
    log: LogView,
    status: Status,
    queue: MessageQueue,
    tool: Arc<dyn FlashTool>,
    opener: Arc<dyn SerialOpener>,
    list_ports: PortLister,
    tool_busy: bool,
    tool_thread: Option<JoinHandle<()>>,
    pending_tool: Option<PendingJob>,
    monitor: Option<MonitorHandle>,
    last_outcome: Option<ToolOutcome>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("session", &self.session)
            .field("ports", &self.ports)
            .field("status", &self.status)
            .field("tool_busy", &self.tool_busy)
            .field("monitor_running", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create a controller with default settings. Ports are not listed until
    /// [`Controller::refresh_ports`] is called.
    pub fn new(tool: Arc<dyn FlashTool>, opener: Arc<dyn SerialOpener>) -> Self {
        Self {
            session: Session::default(),
            ports: Vec::new(),
            log: LogView::default(),
            status: Status::Ready,
            queue: MessageQueue::new(),
            tool,
            opener,
            list_ports: Box::new(port::list_ports),
            tool_busy: false,
            tool_thread: None,
            pending_tool: None,
            monitor: None,
            last_outcome: None,
        }
    }

    /// Replace the port enumerator.
    #[must_use]
    pub fn with_port_lister<F>(mut self, lister: F) -> Self
    where
        F: Fn() -> Vec<PortDescriptor> + Send + 'static,
    {
        self.list_ports = Box::new(lister);
        self
    }

    /// Replace the initial settings.
    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    /// Current settings.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Ports from the last refresh.
    pub fn ports(&self) -> &[PortDescriptor] {
        &self.ports
    }

    /// The log view text.
    pub fn log(&self) -> &str {
        self.log.as_str()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// How the most recent tool run ended, once it has.
    pub fn last_outcome(&self) -> Option<&ToolOutcome> {
        self.last_outcome.as_ref()
    }

    /// Whether a tool operation is queued or running.
    pub fn tool_busy(&self) -> bool {
        self.tool_busy
    }

    /// Whether a monitor session is open or still shutting down.
    pub fn monitor_running(&self) -> bool {
        self.monitor.is_some()
    }

    /// Whether neither the tool nor the monitor is active.
    pub fn is_idle(&self) -> bool {
        !self.tool_busy && !self.monitor_running()
    }

    /// Current control enablement.
    pub fn controls(&self) -> Controls {
        let monitor = self.monitor_running();
        Controls {
            selectors: !self.tool_busy && !monitor,
            tool_actions: !self.tool_busy && !monitor,
            monitor_toggle: !self.tool_busy,
            monitor_settings: !self.tool_busy && !monitor,
        }
    }

    fn ensure_selectors(&self) -> Result<()> {
        if self.tool_busy {
            Err(Error::ToolBusy)
        } else if self.monitor_running() {
            Err(Error::MonitorRunning)
        } else {
            Ok(())
        }
    }

    /// Re-enumerate ports.
    ///
    /// Keeps the selection if that device is still present, otherwise selects
    /// the first port. Ignored while selectors are disabled.
    pub fn refresh_ports(&mut self) {
        if !self.controls().selectors {
            debug!("Port refresh ignored while busy");
            return;
        }

        self.ports = (self.list_ports)();
        let keep = self
            .session
            .port
            .as_deref()
            .and_then(|device| port::find_port(&self.ports, device))
            .or_else(|| self.ports.first())
            .map(|p| p.device.clone());
        self.session.port = keep;

        self.status = if self.ports.is_empty() {
            Status::NoPorts
        } else {
            Status::FoundPorts(self.ports.len())
        };
        debug!("{}", self.status);
    }

    /// Select a device. A device missing from the last listing is accepted
    /// as given, so ports the OS does not enumerate can still be used.
    pub fn select_port(&mut self, device: &str) -> Result<()> {
        self.ensure_selectors()?;
        let device = device.trim();
        if device.is_empty() {
            return Err(Error::NoPortSelected);
        }
        let device = match port::find_port(&self.ports, device) {
            Some(p) => p.device.clone(),
            None => {
                debug!("{device} is not in the port list, using it as given");
                device.to_string()
            },
        };
        self.session.port = Some(device);
        Ok(())
    }

    /// Select the port at `index` in the last listing.
    pub fn select_port_index(&mut self, index: usize) -> Result<()> {
        self.ensure_selectors()?;
        let device = self
            .ports
            .get(index)
            .map(|p| p.device.clone())
            .ok_or_else(|| Error::InvalidValue(format!("no port at index {index}")))?;
        self.session.port = Some(device);
        Ok(())
    }

    /// Select the port after the current one, wrapping around.
    pub fn select_next_port(&mut self) -> Result<()> {
        self.ensure_selectors()?;
        if self.ports.is_empty() {
            return Err(Error::NoPortSelected);
        }
        let next = self
            .session
            .port
            .as_deref()
            .and_then(|device| self.ports.iter().position(|p| p.device == device))
            .map_or(0, |i| (i + 1) % self.ports.len());
        self.select_port_index(next)
    }

    /// Set the chip target.
    pub fn set_chip(&mut self, chip: Chip) -> Result<()> {
        self.ensure_selectors()?;
        self.session.chip = chip;
        Ok(())
    }

    /// Set the flashing baud rate.
    pub fn set_flash_baud(&mut self, baud: Option<u32>) -> Result<()> {
        self.ensure_selectors()?;
        if baud == Some(0) {
            return Err(Error::InvalidValue("baud rate must be positive".to_string()));
        }
        self.session.flash_baud = baud;
        Ok(())
    }

    /// Set the monitor baud rate used by the next session.
    pub fn set_monitor_baud(&mut self, baud: u32) -> Result<()> {
        self.ensure_selectors()?;
        if baud == 0 {
            return Err(Error::InvalidValue("baud rate must be positive".to_string()));
        }
        self.session.monitor_baud = baud;
        Ok(())
    }

    /// Turn timestamped monitor output on or off for the next session.
    pub fn set_timestamps(&mut self, enabled: bool) -> Result<()> {
        self.ensure_selectors()?;
        self.session.monitor_mode = MonitorMode::from_timestamps(enabled);
        Ok(())
    }

    /// Set the project root or build folder.
    pub fn set_project_dir(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        self.ensure_selectors()?;
        self.session.project_dir = dir.as_ref().to_path_buf();
        Ok(())
    }

    /// Empty the log view.
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    fn selected_port(&self) -> Result<String> {
        self.session.port.clone().ok_or(Error::NoPortSelected)
    }

    fn ensure_tool_ready(&self) -> Result<String> {
        if self.tool_busy {
            warn!("Rejected tool operation: another operation is running");
            return Err(Error::ToolBusy);
        }
        self.selected_port()
    }

    /// Write the images listed in the project's `flash_args`.
    pub fn flash(&mut self) -> Result<()> {
        let port = self.ensure_tool_ready()?;
        let args = find_flash_args(&self.session.project_dir)?;

        let baud = self
            .session
            .flash_baud
            .map_or_else(|| "default".to_string(), |b| b.to_string());
        let header = format!(
            "\n=== FLASH: {port} | chip={} | baud={baud} ===\nUsing: {}\n",
            self.session.chip,
            args.path.display()
        );
        self.start_tool_operation(&port, Operation::WriteFlash(args), header)
    }

    /// Erase the whole flash.
    pub fn erase(&mut self) -> Result<()> {
        let port = self.ensure_tool_ready()?;
        let header = format!("\n=== ERASE FLASH: {port} | chip={} ===\n", self.session.chip);
        self.start_tool_operation(&port, Operation::EraseFlash, header)
    }

    /// Read the factory MAC address.
    pub fn read_mac(&mut self) -> Result<()> {
        let port = self.ensure_tool_ready()?;
        let header = format!("\n=== READ MAC: {port} | chip={} ===\n", self.session.chip);
        self.start_tool_operation(&port, Operation::ReadMac, header)
    }

    /// Launch the tool, or park it behind a monitor stop. `header` goes into
    /// the log right before the tool starts.
    fn start_tool_operation(
        &mut self,
        port: &str,
        operation: Operation,
        header: String,
    ) -> Result<()> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let invocation = build_invocation(
            self.session.chip,
            port,
            self.session.flash_baud,
            &operation,
            &cwd,
        );

        if let Some(monitor) = &self.monitor {
            self.log
                .append(&format!("Stopping monitor before {}...\n", operation.label()));
            info!("Stopping monitor before {}", operation.label());
            monitor.request_stop();
            self.pending_tool = Some(PendingJob { header, invocation });
            self.tool_busy = true;
            self.last_outcome = None;
            self.status = Status::Working;
            return Ok(());
        }

        self.log.append(&header);
        self.launch_tool(invocation)
    }

    fn launch_tool(&mut self, invocation: ToolInvocation) -> Result<()> {
        let handle = spawn_tool(Arc::clone(&self.tool), invocation, self.queue.sender())?;
        self.tool_thread = Some(handle);
        self.tool_busy = true;
        self.last_outcome = None;
        self.status = Status::Working;
        Ok(())
    }

    /// Open the selected port and stream it into the log.
    pub fn start_monitor(&mut self) -> Result<()> {
        if self.tool_busy {
            warn!("Rejected monitor start: a tool operation is running");
            return Err(Error::ToolBusy);
        }
        if self.monitor_running() {
            return Err(Error::MonitorRunning);
        }
        let device = self.selected_port()?;

        let config = MonitorConfig {
            device,
            baud: self.session.monitor_baud,
            mode: self.session.monitor_mode,
        };
        let handle = MonitorHandle::spawn(Arc::clone(&self.opener), config, self.queue.sender())?;
        self.monitor = Some(handle);
        self.status = Status::Monitoring;
        Ok(())
    }

    /// Ask the monitor to stop. Controls re-enable once it reports back.
    pub fn stop_monitor(&mut self) {
        if let Some(monitor) = &self.monitor {
            if !monitor.stop_requested() {
                info!("Stopping monitor");
                monitor.request_stop();
            }
        }
    }

    /// Start the monitor if it is stopped, stop it otherwise.
    pub fn toggle_monitor(&mut self) -> Result<()> {
        if self.monitor_running() {
            self.stop_monitor();
            Ok(())
        } else {
            self.start_monitor()
        }
    }

    /// Drain the message queue and apply everything in it, in order.
    pub fn poll(&mut self) -> PollUpdate {
        let mut update = PollUpdate::default();
        // Checked before draining: a thread that has already exited has
        // nothing left to send.
        let monitor_exited = self
            .monitor
            .as_ref()
            .is_some_and(MonitorHandle::is_finished);

        for message in self.queue.drain() {
            match message.kind() {
                MessageKind::StandardOutput | MessageKind::ErrorOutput => {
                    update.appended.push_str(message.payload());
                },
                MessageKind::ToolDone => {
                    let outcome = if message.payload().is_empty() {
                        ToolOutcome::Succeeded
                    } else {
                        ToolOutcome::Failed(message.payload().to_string())
                    };
                    self.finish_tool(outcome.clone());
                    update.tool_outcome = Some(outcome);
                },
                MessageKind::MonitorDone => self.monitor_stopped(&mut update),
            }
        }

        if monitor_exited && self.monitor.is_some() {
            warn!("Monitor thread exited without reporting back");
            self.monitor_stopped(&mut update);
        }

        self.log.append(&update.appended);
        update
    }

    fn monitor_stopped(&mut self, update: &mut PollUpdate) {
        self.monitor = None;
        update.monitor_stopped = true;
        self.status = Status::Ready;

        let Some(job) = self.pending_tool.take() else {
            return;
        };
        update.appended.push_str(&job.header);
        if let Err(e) = self.launch_tool(job.invocation) {
            warn!("Failed to start queued tool job: {e}");
            update.appended.push_str(&format!("\n[Exception] {e}\n"));
            let outcome = ToolOutcome::Failed(e.to_string());
            self.finish_tool(outcome.clone());
            update.tool_outcome = Some(outcome);
        }
    }

    fn finish_tool(&mut self, outcome: ToolOutcome) {
        if let Some(thread) = self.tool_thread.take() {
            if thread.is_finished() && thread.join().is_err() {
                warn!("Tool thread panicked");
            }
        }
        self.tool_busy = false;
        self.last_outcome = Some(outcome);
        self.status = Status::Done;
    }

    /// Stop the monitor and wait for it to release the device.
    ///
    /// A running tool cannot be cancelled and is left to finish on its own.
    pub fn shutdown(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop_and_join();
        }
        self.pending_tool = None;
        if self.tool_busy {
            warn!("Exiting while a tool operation is still running");
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
