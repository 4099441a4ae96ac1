//! Serial port channel implementation
//!
//! Adapts the `serialport` crate to the [`LinkReader`]/[`LinkWriter`] split.
//! The device handle is cloned so the reader can sit in a time-boxed read
//! while a writer transmits.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Line-oriented reads with a per-call timeout
//! - DTR pulse to hardware-reset the firmware

use super::{ConnectionParams, Connector, LinkReader, LinkWriter, ReadOutcome, SerialLink};
use gcodelink_core::{ConnectionError, Error, Result};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that look like printer boards
///
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_printer_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let info = info.with_usb_ids(usb.vid, usb.pid);
                    match usb.manufacturer {
                        Some(ref mfg) => info.with_manufacturer(mfg),
                        None => info,
                    }
                }
                _ => info,
            }
        })
        .collect())
}

fn is_printer_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Opens real serial devices
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, params: &ConnectionParams) -> Result<SerialLink> {
        let open_failed = |reason: String| {
            tracing::warn!("Failed to open serial port {}: {}", params.port, reason);
            Error::from(ConnectionError::OpenFailed {
                port: params.port.clone(),
                baud_rate: params.baud_rate,
                reason,
            })
        };

        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(params.read_timeout())
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| open_failed(e.to_string()))?;

        let reader_port = port.try_clone().map_err(|e| open_failed(e.to_string()))?;

        Ok(SerialLink {
            reader: Box::new(SerialReader {
                port: reader_port,
                pending: Vec::new(),
            }),
            writer: Box::new(SerialWriter { port: Some(port) }),
        })
    }
}

/// Reading half of a serial device
pub struct SerialReader {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SerialReader {
    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl LinkReader for SerialReader {
    fn read_line(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];

        loop {
            if let Some(line) = self.take_line() {
                return Ok(ReadOutcome::Line(line));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadOutcome::Timeout);
            }

            self.port.set_timeout(remaining)?;
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Timeout),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(ReadOutcome::Timeout),
                Err(e) => return Err(e),
            }
        }
    }

    fn is_data_available(&mut self) -> io::Result<bool> {
        if self.pending.contains(&b'\n') {
            return Ok(true);
        }
        let waiting = self.port.bytes_to_read()?;
        Ok(waiting > 0)
    }
}

/// Writing half of a serial device
pub struct SerialWriter {
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialWriter {
    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl LinkWriter for SerialWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()
    }

    fn assert_reset(&mut self) -> io::Result<()> {
        let port = self.port()?;
        port.write_data_terminal_ready(true)?;
        std::thread::sleep(Duration::from_millis(100));
        port.write_data_terminal_ready(false)?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printer_port_patterns() {
        assert!(is_printer_port("/dev/ttyACM0"));
        assert!(is_printer_port("/dev/ttyUSB1"));
        assert!(is_printer_port("COM7"));
        assert!(is_printer_port("/dev/cu.usbmodem14101"));
        assert!(!is_printer_port("COM"));
        assert!(!is_printer_port("/dev/ttyS0"));
        assert!(!is_printer_port("/dev/null"));
    }

    #[test]
    fn test_open_missing_port_reports_open_failed() {
        let params = ConnectionParams::new("/dev/gcodelink-does-not-exist", 250_000);
        let err = SerialConnector.open(&params).unwrap_err();
        assert!(err.is_channel_failure());
        assert!(err.to_string().contains("/dev/gcodelink-does-not-exist"));
    }
}
