//! One-shot flash, erase, read-mac and monitor commands.
//!
//! These drive the same controller as the interactive shell and stream the
//! log view to stdout. Status lines go to stderr so the log stays pipeable.

use anyhow::{Result, anyhow};
use console::style;
use flashdock::{Controller, ToolOutcome};
use std::io::{self, Write as _};
use std::thread;

use crate::{CliError, Settings, clear_interrupted_flag, was_interrupted};

/// Writes whatever the log view gained since the last call.
#[derive(Debug, Default)]
struct LogPrinter {
    offset: usize,
}

impl LogPrinter {
    /// Start after the text already in the log.
    fn skip_existing(ctrl: &Controller) -> Self {
        Self {
            offset: ctrl.log().len(),
        }
    }

    fn print_new(&mut self, ctrl: &Controller, out: &mut impl io::Write) -> io::Result<()> {
        let log = ctrl.log();
        if self.offset > log.len() {
            self.offset = 0;
        }
        let fresh = &log[self.offset..];
        if !fresh.is_empty() {
            out.write_all(fresh.as_bytes())?;
            out.flush()?;
        }
        self.offset = log.len();
        Ok(())
    }
}

fn announce(ctrl: &Controller, quiet: bool) {
    if quiet {
        return;
    }
    let session = ctrl.session();
    if let Some(port) = &session.port {
        eprintln!(
            "{} {} (chip={})",
            style("🔌").cyan(),
            style(port).green(),
            session.chip
        );
    }
}

/// Poll until the tool run started on `ctrl` completes.
fn wait_for_tool(
    ctrl: &mut Controller,
    printer: &mut LogPrinter,
    settings: &Settings,
) -> Result<()> {
    let mut stdout = io::stdout();
    loop {
        let update = ctrl.poll();
        printer.print_new(ctrl, &mut stdout)?;

        match update.tool_outcome {
            Some(ToolOutcome::Succeeded) => return Ok(()),
            Some(ToolOutcome::Failed(summary)) => return Err(anyhow!(summary)),
            None => {},
        }

        if was_interrupted() {
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        }
        thread::sleep(settings.tick);
    }
}

fn run_tool_command(
    settings: &Settings,
    quiet: bool,
    start: fn(&mut Controller) -> flashdock::Result<()>,
) -> Result<()> {
    let mut ctrl = settings.controller()?;
    ctrl.clear_log();
    announce(&ctrl, quiet);

    let mut printer = LogPrinter::default();
    start(&mut ctrl)?;
    wait_for_tool(&mut ctrl, &mut printer, settings)?;

    if !quiet {
        eprintln!("{} {}", style("✓").green(), ctrl.status());
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(settings: &Settings, quiet: bool) -> Result<()> {
    run_tool_command(settings, quiet, Controller::flash)
}

/// Erase command implementation.
pub(crate) fn cmd_erase(settings: &Settings, quiet: bool) -> Result<()> {
    run_tool_command(settings, quiet, Controller::erase)
}

/// Read-mac command implementation.
pub(crate) fn cmd_read_mac(settings: &Settings, quiet: bool) -> Result<()> {
    run_tool_command(settings, quiet, Controller::read_mac)
}

/// Monitor command implementation. Runs until Ctrl-C or a device error.
pub(crate) fn cmd_monitor(settings: &Settings, quiet: bool) -> Result<()> {
    let mut ctrl = settings.controller()?;
    let mut printer = LogPrinter::skip_existing(&ctrl);
    clear_interrupted_flag();

    ctrl.start_monitor()?;
    if !quiet {
        eprintln!("{}", style("Press Ctrl-C to exit").dim());
    }

    let mut stdout = io::stdout();
    let mut user_stopped = false;
    loop {
        let update = ctrl.poll();
        printer.print_new(&ctrl, &mut stdout)?;
        if update.monitor_stopped {
            break;
        }
        if was_interrupted() {
            clear_interrupted_flag();
            user_stopped = true;
            ctrl.stop_monitor();
        }
        thread::sleep(settings.tick);
    }

    if user_stopped {
        Ok(())
    } else {
        let port = ctrl.session().port.clone().unwrap_or_default();
        Err(anyhow!("Serial monitor on {port} stopped unexpectedly"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashdock::{FlashTool, LineSink, SerialHandle, SerialOpener};
    use std::path::Path;
    use std::sync::Arc;

    struct EchoTool;

    impl FlashTool for EchoTool {
        fn run(
            &self,
            argv: &[String],
            _working_dir: &Path,
            stdout: &mut LineSink,
            _stderr: &mut LineSink,
        ) -> flashdock::Result<i32> {
            stdout.write_str(&format!("{}\n", argv.join(" ")));
            Ok(0)
        }
    }

    struct NoDevice;

    impl SerialOpener for NoDevice {
        fn open(&self, device: &str, _baud: u32) -> flashdock::Result<SerialHandle> {
            Err(flashdock::Error::InvalidValue(format!("no device {device}")))
        }
    }

    fn controller() -> Controller {
        let mut ctrl = Controller::new(Arc::new(EchoTool), Arc::new(NoDevice))
            .with_port_lister(|| vec![flashdock::PortDescriptor::new("COM4", None, None)]);
        ctrl.refresh_ports();
        ctrl
    }

    #[test]
    fn test_log_printer_writes_only_new_text() {
        let mut ctrl = controller();
        let mut printer = LogPrinter::skip_existing(&ctrl);
        let mut out = Vec::new();

        printer.print_new(&ctrl, &mut out).unwrap();
        assert!(out.is_empty());

        ctrl.read_mac().unwrap();
        printer.print_new(&ctrl, &mut out).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert_eq!(text, "\n=== READ MAC: COM4 | chip=esp32 ===\n");

        while ctrl.poll().tool_outcome.is_none() {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        out.clear();
        printer.print_new(&ctrl, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "esptool --chip esp32 --port COM4 read-mac\n"
        );
    }

    #[test]
    fn test_log_printer_restarts_after_clear() {
        let mut ctrl = controller();
        let mut printer = LogPrinter::skip_existing(&ctrl);
        ctrl.clear_log();
        ctrl.erase().unwrap();

        let mut out = Vec::new();
        printer.print_new(&ctrl, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("\n=== ERASE FLASH: COM4"));
    }
}
