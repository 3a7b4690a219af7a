//! Interactive terminal shell.
//!
//! The terminal runs in raw mode. Every tick the shell drains the
//! controller, prints new log text and handles at most the key presses that
//! arrived during the tick. The controller decides what is allowed; the
//! shell only reports refusals.

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::{cursor, execute, terminal};
use flashdock::{Controller, FLASH_BAUDS, MONITOR_BAUDS, MonitorMode};
use log::debug;
use std::io::{self, Write as _};

use crate::Settings;

const HELP: &str = "keys: f flash | e erase | m read-mac | s monitor on/off | t timestamps | \
p port | c chip | b baud | B monitor baud | r refresh | l clear | h help | q quit";

/// A shell command bound to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Flash,
    Erase,
    ReadMac,
    ToggleMonitor,
    ToggleTimestamps,
    NextPort,
    NextChip,
    NextFlashBaud,
    NextMonitorBaud,
    Refresh,
    ClearLog,
    Help,
    Quit,
}

fn action_for(key: &KeyEvent) -> Option<Action> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c' | 'd') => Some(Action::Quit),
            _ => None,
        };
    }
    match key.code {
        KeyCode::Char('f') => Some(Action::Flash),
        KeyCode::Char('e') => Some(Action::Erase),
        KeyCode::Char('m') => Some(Action::ReadMac),
        KeyCode::Char('s') => Some(Action::ToggleMonitor),
        KeyCode::Char('t') => Some(Action::ToggleTimestamps),
        KeyCode::Char('p') => Some(Action::NextPort),
        KeyCode::Char('c') => Some(Action::NextChip),
        KeyCode::Char('b') => Some(Action::NextFlashBaud),
        KeyCode::Char('B') => Some(Action::NextMonitorBaud),
        KeyCode::Char('r') => Some(Action::Refresh),
        KeyCode::Char('l') => Some(Action::ClearLog),
        KeyCode::Char('h' | '?') => Some(Action::Help),
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        _ => None,
    }
}

/// The entry after `current` in `choices`, wrapping around. Unknown values
/// restart at the first entry.
fn next_in(choices: &[u32], current: Option<u32>) -> u32 {
    let next = current
        .and_then(|c| choices.iter().position(|&b| b == c))
        .map_or(0, |i| (i + 1) % choices.len());
    choices[next]
}

/// Raw mode wants explicit carriage returns.
fn to_terminal_text(text: &str) -> String {
    text.replace('\n', "\r\n")
}

fn summary(ctrl: &Controller) -> String {
    let session = ctrl.session();
    let baud = session
        .flash_baud
        .map_or_else(|| "default".to_string(), |b| b.to_string());
    let timestamps = if session.monitor_mode == MonitorMode::Timestamped {
        "on"
    } else {
        "off"
    };
    format!(
        "[{}] port={} chip={} baud={} monitor={} timestamps={}",
        ctrl.status(),
        session.port.as_deref().unwrap_or("-"),
        session.chip,
        baud,
        session.monitor_baud,
        timestamps
    )
}

/// Terminal output that keeps status lines on their own row.
struct Screen {
    out: io::Stdout,
    at_line_start: bool,
}

impl Screen {
    fn new() -> Self {
        Self {
            out: io::stdout(),
            at_line_start: true,
        }
    }

    fn log(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.out.write_all(to_terminal_text(text).as_bytes())?;
        self.at_line_start = text.ends_with('\n');
        self.out.flush()
    }

    fn status_line(&mut self, message: &str) -> io::Result<()> {
        if !self.at_line_start {
            self.out.write_all(b"\r\n")?;
        }
        write!(self.out, "\r\x1b[2K{message}\r\n")?;
        self.at_line_start = true;
        self.out.flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        execute!(
            self.out,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        self.at_line_start = true;
        Ok(())
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// What the loop should do after a key.
enum Flow {
    Continue,
    Quit,
}

fn apply(
    ctrl: &mut Controller,
    action: Action,
    screen: &mut Screen,
    quit_armed: &mut bool,
) -> Result<Flow> {
    let session = ctrl.session().clone();
    let result = match action {
        Action::Flash => ctrl.flash(),
        Action::Erase => ctrl.erase(),
        Action::ReadMac => ctrl.read_mac(),
        Action::ToggleMonitor => ctrl.toggle_monitor(),
        Action::ToggleTimestamps => {
            ctrl.set_timestamps(session.monitor_mode != MonitorMode::Timestamped)
        },
        Action::NextPort => ctrl.select_next_port(),
        Action::NextChip => ctrl.set_chip(session.chip.next()),
        Action::NextFlashBaud => {
            ctrl.set_flash_baud(Some(next_in(FLASH_BAUDS, session.flash_baud)))
        },
        Action::NextMonitorBaud => {
            ctrl.set_monitor_baud(next_in(MONITOR_BAUDS, Some(session.monitor_baud)))
        },
        Action::Refresh => {
            if !ctrl.controls().selectors {
                screen.status_line(&format!(
                    "{} Refresh is unavailable while busy",
                    style("⚠").yellow()
                ))?;
            }
            ctrl.refresh_ports();
            for port in ctrl.ports() {
                screen.status_line(&format!("  {} {}", style("•").green(), port.label))?;
            }
            Ok(())
        },
        Action::ClearLog => {
            ctrl.clear_log();
            screen.clear()?;
            Ok(())
        },
        Action::Help => {
            screen.status_line(&style(HELP).dim().to_string())?;
            Ok(())
        },
        Action::Quit => {
            if ctrl.tool_busy() && !*quit_armed {
                *quit_armed = true;
                screen.status_line(&format!(
                    "{} esptool is still running; press q again to quit anyway",
                    style("⚠").yellow()
                ))?;
                return Ok(Flow::Continue);
            }
            return Ok(Flow::Quit);
        },
    };
    *quit_armed = false;

    if let Err(e) = result {
        debug!("{action:?} refused: {e}");
        screen.status_line(&format!("{} {e}", style("⚠").yellow()))?;
    }
    Ok(Flow::Continue)
}

/// Interactive shell command implementation.
pub(crate) fn cmd_shell(settings: &Settings) -> Result<()> {
    let mut ctrl = settings.controller()?;
    let mut screen = Screen::new();

    terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
    let _raw_guard = RawModeGuard;

    screen.log(ctrl.log())?;
    screen.status_line(&style(HELP).dim().to_string())?;
    let mut last_summary = summary(&ctrl);
    screen.status_line(&last_summary)?;

    let mut quit_armed = false;
    loop {
        let update = ctrl.poll();
        screen.log(&update.appended)?;

        if event::poll(settings.tick)? {
            if let Event::Key(key) = event::read()? {
                if let Some(action) = action_for(&key) {
                    if let Flow::Quit = apply(&mut ctrl, action, &mut screen, &mut quit_armed)? {
                        break;
                    }
                }
            }
        }

        let current = summary(&ctrl);
        if current != last_summary {
            screen.status_line(&current)?;
            last_summary = current;
        }
    }

    ctrl.shutdown();
    screen.log(&ctrl.poll().appended)?;
    Ok(())
}
