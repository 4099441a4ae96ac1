//! Error handling for gcodelink
//!
//! Provides the error taxonomy for every layer of the transport:
//! - Connection errors (serial channel open/read/write failures)
//! - Protocol errors (resend requests the session cannot satisfy)
//! - Session errors (state machine violations, misuse of the API)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Covers the serial channel itself. A single failed read or write is
/// `Transient` and is retried by the calling loop; everything else is fatal
/// to the connected session.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// A single read or write failed and may succeed on retry
    #[error("Transient I/O error on {operation}: {reason}")]
    Transient {
        /// The operation that failed ("read" or "write").
        operation: String,
        /// The underlying failure.
        reason: String,
    },

    /// The channel could not be opened
    #[error("Failed to open {port} at {baud_rate} baud: {reason}")]
    OpenFailed {
        /// The port that could not be opened.
        port: String,
        /// The requested baud rate.
        baud_rate: u32,
        /// The reason the open failed.
        reason: String,
    },

    /// The channel closed underneath the session
    #[error("Channel closed unexpectedly: {reason}")]
    Closed {
        /// The reason reported by the driver.
        reason: String,
    },

    /// Transient failures kept recurring past the retry budget
    #[error("{operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        /// The operation that kept failing.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last failure seen.
        reason: String,
    },
}

/// Protocol error type
///
/// Raised when the firmware asks for something the session can no longer
/// deliver without renumbering. Fatal to the current stream only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A resend targeted a sequence number that is not in history
    #[error("Resend requested for line {sequence}, which is not in the send history")]
    MissingHistory {
        /// The requested sequence number.
        sequence: u64,
    },

    /// A second resend did not move below the first one
    #[error("Firmware repeated resend for line {repeated} while resending from line {first}")]
    RepeatedResend {
        /// Target of the resend being served.
        first: u64,
        /// Target of the repeated request.
        repeated: u64,
    },
}

/// Session error type
///
/// Represents misuse of the session API and state machine violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Invalid state transition
    #[error("Invalid state transition from {current} to {requested}")]
    InvalidStateTransition {
        /// The current state name.
        current: String,
        /// The requested state name.
        requested: String,
    },

    /// Operation requires a connected session
    #[error("Session not connected")]
    NotConnected,

    /// Connect was called on a connected session
    #[error("Session already connected")]
    AlreadyConnected,

    /// A stream is already running
    #[error("A stream is already active")]
    StreamActive,

    /// Abort was requested with no stream running
    #[error("No stream is active")]
    NoActiveStream,
}

/// Main error type for gcodelink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Session error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Transient { .. }))
    }

    /// Check if this error means the channel is gone
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            Error::Connection(
                ConnectionError::OpenFailed { .. }
                    | ConnectionError::Closed { .. }
                    | ConnectionError::RetriesExhausted { .. }
            )
        )
    }

    /// Check if this error desynchronized the current stream
    pub fn is_protocol_desync(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this is a session error
    pub fn is_session_error(&self) -> bool {
        matches!(self, Error::Session(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
