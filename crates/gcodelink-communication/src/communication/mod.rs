//! Channel abstraction over the byte-level serial driver
//!
//! The session never touches a device directly. It asks a [`Connector`] for a
//! [`SerialLink`], which is split into a reading half owned by the reader task
//! and a writing half owned by whichever writer is active.

pub mod serial;

use gcodelink_core::Result;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

pub use serial::{list_ports, SerialConnector, SerialPortInfo};

/// Parameters for opening a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Device path or port name
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound for a single time-boxed read, in milliseconds
    pub read_timeout_ms: u64,
    /// Toggle DTR after opening to hardware-reset the firmware
    pub reset_on_connect: bool,
}

impl ConnectionParams {
    /// Create params for a port and baud rate with default timing
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 250_000,
            read_timeout_ms: 250,
            reset_on_connect: true,
        }
    }
}

/// Result of a time-boxed read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line, without its terminator
    Line(String),
    /// Nothing arrived before the timeout
    Timeout,
}

/// Reading half of a channel
pub trait LinkReader: Send {
    /// Read one line, waiting at most `timeout`
    fn read_line(&mut self, timeout: Duration) -> io::Result<ReadOutcome>;

    /// Whether bytes are waiting to be read
    fn is_data_available(&mut self) -> io::Result<bool>;
}

/// Writing half of a channel
pub trait LinkWriter: Send {
    /// Write all bytes
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Pulse the reset control line
    fn assert_reset(&mut self) -> io::Result<()>;

    /// Release the device
    fn close(&mut self) -> io::Result<()>;
}

/// An open channel, split for the reader and writer tasks
pub struct SerialLink {
    /// Reading half
    pub reader: Box<dyn LinkReader>,
    /// Writing half
    pub writer: Box<dyn LinkWriter>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").finish_non_exhaustive()
    }
}

/// Opens channels
pub trait Connector: Send + Sync {
    /// Open a channel with the given parameters
    fn open(&self, params: &ConnectionParams) -> Result<SerialLink>;
}

/// Whether an I/O error means the channel is gone rather than hiccuping
pub fn is_fatal_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
    )
}
