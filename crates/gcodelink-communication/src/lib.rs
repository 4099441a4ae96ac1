//! # gcodelink Communication
//!
//! Reliable command transport for Marlin-family firmware over a serial link.
//! Frames commands with line numbers and checksums, gates transmission on the
//! firmware's input buffer, replays history on resend requests, and
//! arbitrates between interactive commands and a bulk stream.

pub mod communication;
pub mod session;
pub mod transport;

pub use communication::{
    is_fatal_io, list_ports, ConnectionParams, Connector, LinkReader, LinkWriter, ReadOutcome,
    SerialConnector, SerialLink, SerialPortInfo,
};

pub use session::{Session, MOTORS_OFF_COMMAND};

pub use transport::{
    command_lines, decode, Acknowledgement, CommandSource, FileSource, FlowState, Frame, Inbound, LineSource,
    ResendRequest, StreamProgress, TransportConfig,
};
