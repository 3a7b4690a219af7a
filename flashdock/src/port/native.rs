//! Native serial port support using the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{MONITOR_READ_TIMEOUT, PortDescriptor, SerialHandle, SerialOpener, UsbIds},
    },
    log::{debug, trace},
};

/// Enumerate serial ports in OS order.
pub(crate) fn enumerate() -> Vec<PortDescriptor> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(describe).collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

fn describe(info: serialport::SerialPortInfo) -> PortDescriptor {
    match info.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            trace!(
                "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                info.port_name, usb.vid, usb.pid
            );
            let description = usb.product.or(usb.manufacturer);
            let ids = UsbIds {
                vid: usb.vid,
                pid: usb.pid,
                serial_number: usb.serial_number,
            };
            PortDescriptor::new(info.port_name, description.as_deref(), Some(&ids))
        },
        serialport::SerialPortType::BluetoothPort => {
            PortDescriptor::new(info.port_name, Some("Bluetooth"), None)
        },
        _ => PortDescriptor::new(info.port_name, None, None),
    }
}

/// Opens real serial devices with the monitor read timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSerialOpener;

impl SerialOpener for NativeSerialOpener {
    fn open(&self, device: &str, baud: u32) -> Result<SerialHandle> {
        let port = serialport::new(device, baud)
            .timeout(MONITOR_READ_TIMEOUT)
            .open()?;
        debug!("Opened {device} at {baud} baud");
        Ok(Box::new(port))
    }
}
