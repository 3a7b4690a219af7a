//! # flashdock
//!
//! A front-end core for flashing and monitoring ESP32-family boards.
//!
//! The heavy lifting is done by an external flashing tool (`esptool`); this
//! crate discovers serial ports, builds the tool's argument vector from the
//! project's `flash_args` manifest, runs the tool on a worker thread and
//! streams its output line by line, and provides a serial monitor that can
//! prefix each received line with a timestamp.
//!
//! ## Architecture
//!
//! ```text
//!        front end (CLI, terminal shell)
//!                     |
//!                     v
//!              +-------------+        +----------------+
//!              | Controller  | <----- |  MessageQueue  |
//!              +------+------+  poll  +--------^-------+
//!                     |                        |
//!          +----------+----------+             |
//!          v                     v             |
//!   +-------------+       +--------------+     |
//!   | tool runner | ----> |   LineSink   | ----+
//!   +-------------+       +--------------+     |
//!   +-------------+                            |
//!   |   monitor   | ---------------------------+
//!   +-------------+
//! ```
//!
//! ## Features
//!
//! - `native` (default): serial enumeration and I/O via the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flashdock::{Controller, ExternalTool, NativeSerialOpener};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctrl = Controller::new(
//!         Arc::new(ExternalTool::locate()),
//!         Arc::new(NativeSerialOpener),
//!     );
//!     ctrl.refresh_ports();
//!     ctrl.set_project_dir("my-project")?;
//!     ctrl.flash()?;
//!
//!     while !ctrl.is_idle() {
//!         print!("{}", ctrl.poll().appended);
//!         std::thread::sleep(std::time::Duration::from_millis(100));
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod args;
pub mod controller;
pub mod error;
pub mod message;
pub mod monitor;
pub mod port;
pub mod sink;
pub mod text;
pub mod tool;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::native::NativeSerialOpener;
pub use {
    args::{
        Chip, DEFAULT_FLASH_BAUD, DEFAULT_MONITOR_BAUD, FLASH_BAUDS, FlashArgs, MONITOR_BAUDS,
        Operation, ToolInvocation, build_invocation, find_flash_args,
    },
    controller::{Controller, Controls, LogView, PollUpdate, Session, Status, ToolOutcome},
    error::{Error, Result},
    message::{Message, MessageKind, MessageQueue, MessageSender},
    monitor::{MonitorConfig, MonitorDecoder, MonitorHandle, MonitorMode, MonitorState},
    port::{PortDescriptor, SerialHandle, SerialOpener, list_ports, sort_ports},
    sink::LineSink,
    tool::{ExternalTool, FlashTool, run_tool, spawn_tool},
};
