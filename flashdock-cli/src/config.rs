//! Configuration file support for flashdock.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FLASHDOCK_*)
//! 3. Local config file (./flashdock.toml)
//! 4. Global config file (~/.config/flashdock/config.toml)
//!
//! `--config <PATH>` replaces both files.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "flashdock.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Flashing baud rate.
    pub baud: Option<u32>,
    /// Monitor baud rate.
    pub monitor_baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashConfig {
    /// Default chip target.
    pub chip: Option<String>,
    /// Project root or build folder.
    pub project_dir: Option<PathBuf>,
    /// Flashing tool command line, e.g. "python -m esptool".
    pub tool: Option<String>,
}

/// Monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Prefix received lines with a timestamp.
    pub timestamps: Option<bool>,
}

/// Terminal shell configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiConfig {
    /// Control loop tick in milliseconds.
    pub poll_interval_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Terminal shell configuration.
    #[serde(default)]
    pub ui: UiConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "flashdock").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        // Connection config
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.monitor_baud.is_some() {
            self.connection.monitor_baud = other.connection.monitor_baud;
        }

        // Flash config
        if other.flash.chip.is_some() {
            self.flash.chip = other.flash.chip;
        }
        if other.flash.project_dir.is_some() {
            self.flash.project_dir = other.flash.project_dir;
        }
        if other.flash.tool.is_some() {
            self.flash.tool = other.flash.tool;
        }

        // Monitor and UI config
        if other.monitor.timestamps.is_some() {
            self.monitor.timestamps = other.monitor.timestamps;
        }
        if other.ui.poll_interval_ms.is_some() {
            self.ui.poll_interval_ms = other.ui.poll_interval_ms;
        }
    }
}
