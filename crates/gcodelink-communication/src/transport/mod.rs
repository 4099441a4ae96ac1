//! Reliable command transport for Marlin-family firmware
//!
//! The pieces the session assembles:
//! - [`codec`]: outbound framing and inbound line classification
//! - [`flow`]: in-flight accounting and the send gate
//! - [`history`]: transmitted frames kept for resend
//! - [`mux`]: shared state and precedence between replay, priority and bulk
//! - [`source`]: restartable bulk command sources and progress
//! - [`config`]: tuning

pub mod codec;
pub mod config;
pub mod flow;
pub mod history;
pub mod mux;
pub mod source;

pub use codec::{checksum, command_lines, decode, strip_comment, Acknowledgement, Frame, Inbound, ResendRequest};
pub use config::TransportConfig;
pub use flow::{FlowState, FlowTracker};
pub use history::History;
pub use mux::{ResendDisposition, Replay, Selection, StreamCursor, TransportState};
pub use source::{CommandSource, FileSource, LineSource, StreamProgress};
