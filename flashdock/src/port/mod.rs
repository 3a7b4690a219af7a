//! Serial port discovery and the transport seam used by the monitor.
//!
//! ## Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |   Controller     |     |  Monitor reader  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   list_ports()   |     |  SerialOpener    |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+------------------------+---------+
//! |          native (serialport crate)        |
//! +-------------------------------------------+
//! ```
//!
//! Enumeration never fails from the caller's point of view: an OS error is
//! logged and treated as "no ports".

#[cfg(feature = "native")]
pub mod native;

use std::io::Read;
use std::time::Duration;

/// Read timeout used by the monitor. Bounds how long a stop request waits.
pub const MONITOR_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A serial device as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortDescriptor {
    /// Human-readable label, e.g. `COM3 — CP2102 USB to UART (USB VID:PID=10C4:EA60)`.
    pub label: String,
    /// Device identifier passed to the tool and the transport.
    pub device: String,
}

/// USB identification attached to a port, when the OS reports one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbIds {
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
    /// Serial number.
    pub serial_number: Option<String>,
}

impl UsbIds {
    /// Hardware ID string in the `USB VID:PID=XXXX:XXXX SER=...` form.
    pub fn hwid(&self) -> String {
        let mut hwid = format!("USB VID:PID={:04X}:{:04X}", self.vid, self.pid);
        if let Some(serial) = self.serial_number.as_deref().filter(|s| !s.is_empty()) {
            hwid.push_str(" SER=");
            hwid.push_str(serial);
        }
        hwid
    }
}

impl PortDescriptor {
    /// Build a descriptor from raw enumeration data.
    pub fn new(device: impl Into<String>, description: Option<&str>, usb: Option<&UsbIds>) -> Self {
        let device = device.into();
        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("n/a");

        let mut label = format!("{device} — {description}");
        if let Some(usb) = usb {
            label.push_str(&format!(" ({})", usb.hwid()));
        }

        Self { label, device }
    }
}

/// Sort key for a device identifier.
///
/// `COM<n>` sorts by `n`; anything else gets `None` and goes last.
pub fn port_sort_key(device: &str) -> Option<u32> {
    let upper = device.to_ascii_uppercase();
    upper.strip_prefix("COM")?.parse().ok()
}

/// Sort ports numerically by `COM` suffix. Unmatched identifiers keep their
/// relative order at the end.
pub fn sort_ports(ports: &mut [PortDescriptor]) {
    ports.sort_by_key(|p| port_sort_key(&p.device).unwrap_or(u32::MAX));
}

/// Find a port by device identifier (exact match first, then ASCII case-insensitive).
pub fn find_port<'a>(ports: &'a [PortDescriptor], device: &str) -> Option<&'a PortDescriptor> {
    ports
        .iter()
        .find(|p| p.device == device)
        .or_else(|| ports.iter().find(|p| p.device.eq_ignore_ascii_case(device)))
}

/// List available serial ports, sorted for display.
#[cfg(feature = "native")]
pub fn list_ports() -> Vec<PortDescriptor> {
    let mut ports = native::enumerate();
    sort_ports(&mut ports);
    ports
}

/// List available serial ports (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn list_ports() -> Vec<PortDescriptor> {
    Vec::new()
}

/// An open serial connection, readable with a short timeout.
///
/// Reads returning [`std::io::ErrorKind::TimedOut`] or `Ok(0)` mean "no data
/// yet". Dropping the handle closes the device.
pub type SerialHandle = Box<dyn Read + Send>;

/// Opens serial devices for the monitor.
pub trait SerialOpener: Send + Sync {
    /// Open `device` at `baud`.
    fn open(&self, device: &str, baud: u32) -> crate::Result<SerialHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(device: &str) -> PortDescriptor {
        PortDescriptor::new(device, None, None)
    }

    fn devices(ports: &[PortDescriptor]) -> Vec<&str> {
        ports.iter().map(|p| p.device.as_str()).collect()
    }

    #[test]
    fn test_sort_numeric_com_suffix() {
        let mut ports = vec![port("COM10"), port("COM2"), port("COM1"), port("ttyUSB0")];
        sort_ports(&mut ports);
        assert_eq!(devices(&ports), ["COM1", "COM2", "COM10", "ttyUSB0"]);
    }

    #[test]
    fn test_sort_unmatched_keep_relative_order() {
        let mut ports = vec![
            port("/dev/ttyUSB1"),
            port("COMX"),
            port("com4"),
            port("/dev/ttyACM0"),
            port("COM3"),
        ];
        sort_ports(&mut ports);
        assert_eq!(
            devices(&ports),
            ["COM3", "com4", "/dev/ttyUSB1", "COMX", "/dev/ttyACM0"]
        );
    }

    #[test]
    fn test_port_sort_key() {
        assert_eq!(port_sort_key("COM7"), Some(7));
        assert_eq!(port_sort_key("com12"), Some(12));
        assert_eq!(port_sort_key("COM"), None);
        assert_eq!(port_sort_key("/dev/ttyUSB0"), None);
    }

    #[test]
    fn test_label_with_usb_ids() {
        let usb = UsbIds {
            vid: 0x10C4,
            pid: 0xEA60,
            serial_number: Some("0001".to_string()),
        };
        let p = PortDescriptor::new("COM3", Some(" CP2102 USB to UART "), Some(&usb));
        assert_eq!(p.label, "COM3 — CP2102 USB to UART (USB VID:PID=10C4:EA60 SER=0001)");
        assert_eq!(p.device, "COM3");
    }

    #[test]
    fn test_label_without_description() {
        let p = PortDescriptor::new("/dev/ttyS0", Some(""), None);
        assert_eq!(p.label, "/dev/ttyS0 — n/a");
    }

    #[test]
    fn test_find_port_case_insensitive() {
        let ports = vec![port("COM3"), port("/dev/ttyUSB0")];
        assert_eq!(find_port(&ports, "com3").map(|p| p.device.as_str()), Some("COM3"));
        assert!(find_port(&ports, "COM9").is_none());
    }

    #[test]
    fn test_list_ports_does_not_panic() {
        let _ = list_ports();
    }
}
