//! flashdock CLI - terminal front end for esptool.
//!
//! ## Features
//!
//! - List serial ports (human-readable or JSON)
//! - Flash a built project from its `flash_args` manifest
//! - Erase flash and read the factory MAC address
//! - Serial monitor with optional line timestamps
//! - Interactive terminal shell combining all of the above
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use flashdock::{Chip, Controller, ExternalTool, NativeSerialOpener, Session};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;

use config::Config;

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether Ctrl-C was pressed since the last check.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Reset the Ctrl-C flag.
pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad input from the user (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// flashdock - flash ESP chips with esptool and watch their serial output.
///
/// Environment variables:
///   FLASHDOCK_PORT   - Default serial port
///   FLASHDOCK_CHIP   - Default chip target (default: esp32)
///   FLASHDOCK_BAUD   - Flashing baud rate (default: 460800)
///   FLASHDOCK_TOOL   - Flashing tool command (default: esptool on PATH)
#[derive(Parser)]
#[command(name = "flashdock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (first detected port if not specified).
    #[arg(short, long, global = true, env = "FLASHDOCK_PORT")]
    port: Option<String>,

    /// Target chip (auto, esp32, esp32s2, esp32s3, esp32c3, esp32c2, esp32c6, esp32h2).
    #[arg(short, long, global = true, env = "FLASHDOCK_CHIP", value_parser = parse_chip)]
    chip: Option<Chip>,

    /// Baud rate for flashing.
    #[arg(short, long, global = true, env = "FLASHDOCK_BAUD")]
    baud: Option<u32>,

    /// Flashing tool command line (e.g. "python -m esptool").
    #[arg(long, global = true, env = "FLASHDOCK_TOOL")]
    tool: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Flash a built project using its flash_args manifest.
    Flash {
        /// Project root or build folder (default: current directory).
        dir: Option<PathBuf>,
    },

    /// Erase the whole flash.
    Erase,

    /// Read the factory MAC address.
    ReadMac,

    /// Open the serial monitor (Ctrl-C to exit).
    Monitor {
        /// Monitor baud rate.
        #[arg(long)]
        monitor_baud: Option<u32>,

        /// Prefix each line with a timestamp.
        #[arg(long)]
        timestamps: bool,
    },

    /// Interactive terminal shell.
    Shell {
        /// Project root or build folder (default: current directory).
        dir: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        shell: Shell,
    },
}

fn parse_chip(s: &str) -> Result<Chip, String> {
    s.parse().map_err(|e: flashdock::Error| e.to_string())
}

/// Settings resolved from flags, environment and config files.
#[derive(Debug)]
pub(crate) struct Settings {
    /// Initial controller session.
    pub session: Session,
    /// Port given explicitly by flag, env or config.
    pub port: Option<String>,
    /// Tool command line, if configured.
    pub tool: Option<String>,
    /// Control loop tick.
    pub tick: Duration,
}

impl Settings {
    /// Merge CLI flags over config values. `dir` overrides the project directory.
    fn resolve(cli: &Cli, config: &Config, dir: Option<&Path>) -> Result<Self> {
        let chip = match (cli.chip, config.flash.chip.as_deref()) {
            (Some(chip), _) => chip,
            (None, Some(name)) => name
                .parse()
                .map_err(|e: flashdock::Error| CliError::Usage(format!("config: {e}")))?,
            (None, None) => Chip::default(),
        };

        let defaults = Session::default();
        let session = Session {
            project_dir: dir
                .map(Path::to_path_buf)
                .or_else(|| config.flash.project_dir.clone())
                .map_or(defaults.project_dir, |d| expand_home(&d)),
            port: None,
            chip,
            flash_baud: cli
                .baud
                .or(config.connection.baud)
                .or(defaults.flash_baud),
            monitor_baud: config.connection.monitor_baud.unwrap_or(defaults.monitor_baud),
            monitor_mode: flashdock::MonitorMode::from_timestamps(
                config.monitor.timestamps.unwrap_or(false),
            ),
        };

        Ok(Self {
            session,
            port: cli.port.clone().or_else(|| config.connection.port.clone()),
            tool: cli.tool.clone().or_else(|| config.flash.tool.clone()),
            tick: Duration::from_millis(config.ui.poll_interval_ms.unwrap_or(100).max(10)),
        })
    }

    /// Build a controller with real ports and the configured tool, with the
    /// port list refreshed and the requested port selected.
    pub(crate) fn controller(&self) -> Result<Controller> {
        let tool = self
            .tool
            .as_deref()
            .map_or_else(ExternalTool::locate, ExternalTool::from_command_line);
        debug!("Tool command: {:?}", tool.command());

        let mut ctrl = Controller::new(Arc::new(tool), Arc::new(NativeSerialOpener))
            .with_session(self.session.clone());
        ctrl.refresh_ports();
        if let Some(port) = &self.port {
            ctrl.select_port(port)
                .with_context(|| format!("Cannot use port {port}"))?;
        }
        Ok(ctrl)
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<flashdock::Error>() {
        Some(e) if e.is_usage() => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "flashdock v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&e))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json)?;
        },
        Commands::Flash { dir } => {
            let settings = Settings::resolve(cli, &config, dir.as_deref())?;
            commands::run::cmd_flash(&settings, cli.quiet)?;
        },
        Commands::Erase => {
            let settings = Settings::resolve(cli, &config, None)?;
            commands::run::cmd_erase(&settings, cli.quiet)?;
        },
        Commands::ReadMac => {
            let settings = Settings::resolve(cli, &config, None)?;
            commands::run::cmd_read_mac(&settings, cli.quiet)?;
        },
        Commands::Monitor {
            monitor_baud,
            timestamps,
        } => {
            let mut settings = Settings::resolve(cli, &config, None)?;
            if let Some(baud) = monitor_baud {
                settings.session.monitor_baud = *baud;
            }
            if *timestamps {
                settings.session.monitor_mode = flashdock::MonitorMode::Timestamped;
            }
            commands::run::cmd_monitor(&settings, cli.quiet)?;
        },
        Commands::Shell { dir } => {
            let settings = Settings::resolve(cli, &config, dir.as_deref())?;
            commands::shell::cmd_shell(&settings)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}
