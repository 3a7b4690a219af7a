//! Error types for flashdock.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for flashdock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for flashdock operations.
///
/// Only user-input problems and I/O failures surface as `Error`. Failures of
/// the flashing tool or the serial monitor are reported as log messages on the
/// queue instead, so they never abort the control loop.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (process spawn, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No serial port has been selected.
    #[error("No serial port selected")]
    NoPortSelected,

    /// Neither candidate location holds a `flash_args` file.
    #[error(
        "flash_args not found. Checked:\n  - {}\n  - {}\nSelect either a project root (contains build/flash_args) or a build folder (contains flash_args), and make sure the project has been built.",
        checked[0].display(),
        checked[1].display()
    )]
    FlashArgsNotFound {
        /// The candidate paths, in lookup order.
        checked: [PathBuf; 2],
    },

    /// A flashing operation is already running.
    #[error("Another operation is running")]
    ToolBusy,

    /// The serial monitor already holds the port.
    #[error("The serial monitor is already running")]
    MonitorRunning,

    /// The flashing tool could not be run to completion.
    #[error("Tool failed: {0}")]
    ToolFailed(String),

    /// Invalid user-supplied value (chip name, baud rate).
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl Error {
    /// Whether this error is caused by user input rather than the environment.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::NoPortSelected
                | Self::FlashArgsNotFound { .. }
                | Self::ToolBusy
                | Self::MonitorRunning
                | Self::InvalidValue(_)
        )
    }
}
