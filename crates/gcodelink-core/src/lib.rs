//! # gcodelink Core
//!
//! Core types shared by the gcodelink crates: the error taxonomy, the
//! session state machine vocabulary, and the sink/event plumbing the
//! transport reports through.

pub mod error;
pub mod event;
pub mod state;

pub use error::{ConnectionError, Error, ProtocolError, Result, SessionError};

pub use event::{EventDispatcher, MessageSink, SessionEvent, SinkHandle, Sinks, TracingSink};

pub use state::{SessionState, StreamOutcome, StreamReport};

