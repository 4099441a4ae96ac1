//! Shared transport state and command source selection
//!
//! [`TransportState`] is the one synchronized boundary between the reader and
//! the active writer. Every operation here runs under the session's lock, so
//! the flow, history, cursor and replay updates stay consistent with each
//! other.
//!
//! Each transmit opportunity, [`TransportState::select`] picks the source of
//! the next frame, highest precedence first:
//! 1. resend replay, while the replay position is below the cursor
//! 2. the priority queue
//! 3. the bulk stream lookahead

use super::codec::{Acknowledgement, Frame, ResendRequest};
use super::config::TransportConfig;
use super::flow::FlowTracker;
use super::history::History;
use super::source::StreamProgress;
use gcodelink_core::{ProtocolError, SessionError, SessionState};
use std::collections::VecDeque;

/// Position of a stream in its source and in the sequence space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    /// Index of the next non-empty source line to frame
    pub next_source_index: u64,
    /// Number of lines in the source, zero when unknown
    pub source_length: u64,
    /// Sequence number the next new frame will carry
    pub next_sequence: u64,
}

impl StreamCursor {
    /// Cursor at the start of a source
    pub fn new(source_length: u64) -> Self {
        Self {
            next_source_index: 0,
            source_length,
            next_sequence: 1,
        }
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// An accepted resend
///
/// Replay is in progress exactly while `next` is below the cursor's next
/// sequence; there is no separate flag. The request stays open after the
/// last retransmission until an acknowledgement covers `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replay {
    /// Target of the accepted request
    pub origin: u64,
    /// Next historical sequence to retransmit
    pub next: u64,
    /// An acknowledgement arrived for `origin` or later
    pub acknowledged: bool,
}

impl Replay {
    fn starting_at(origin: u64) -> Self {
        Self {
            origin,
            next: origin,
            acknowledged: false,
        }
    }

    fn is_open(&self) -> bool {
        !self.acknowledged
    }
}

/// What to transmit next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Retransmit a historical frame byte for byte
    Replay {
        /// Sequence being replayed
        sequence: u64,
        /// Exact bytes originally sent
        wire: String,
    },
    /// A command from the priority queue
    Priority(Frame),
    /// The next bulk stream line
    Bulk(Frame),
    /// Work is waiting but the flow gate is closed
    Blocked,
    /// Nothing to send
    Idle,
}

/// How a resend request was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendDisposition {
    /// Replay starts at the requested sequence
    Accepted,
    /// A lower target arrived mid-replay; replay starts over from it
    Restarted,
    /// Nothing to replay
    Ignored,
    /// The stream cannot recover
    Fatal(ProtocolError),
}

/// Everything the reader and writers share
#[derive(Debug)]
pub struct TransportState {
    /// Session state; `Resending` is derived, never stored
    pub session: SessionState,
    /// Flow control counters
    pub flow: FlowTracker,
    /// Frames sent during the current stream
    pub history: History,
    /// Commands to honour ahead of the bulk stream
    pub priority: VecDeque<String>,
    /// Present while a stream runs
    pub cursor: Option<StreamCursor>,
    /// Most recently accepted resend
    pub replay: Option<Replay>,
    /// Desync raised by the reader, consumed by the writer
    pub fault: Option<ProtocolError>,
    /// Firmware announced readiness on this connection
    pub ready: bool,
    /// Progress of the current or last stream
    pub progress: StreamProgress,
    /// New numbered frames sent in the current stream
    pub frames_sent: u64,
    /// Frames retransmitted in the current stream
    pub frames_replayed: u64,
}

impl TransportState {
    /// Fresh state for a disconnected session
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            session: SessionState::Disconnected,
            flow: FlowTracker::new(config.input_buffer_slots, config.plan_buffer_slots),
            history: History::new(),
            priority: VecDeque::new(),
            cursor: None,
            replay: None,
            fault: None,
            ready: false,
            progress: StreamProgress::default(),
            frames_sent: 0,
            frames_replayed: 0,
        }
    }

    /// Whether a replay is in progress
    pub fn is_resending(&self) -> bool {
        match (self.replay, self.cursor) {
            (Some(replay), Some(cursor)) => replay.next < cursor.next_sequence,
            _ => false,
        }
    }

    /// Session state with `Resending` derived from the replay position
    pub fn state(&self) -> SessionState {
        match self.session {
            SessionState::Streaming | SessionState::Finalizing if self.is_resending() => {
                SessionState::Resending
            }
            state => state,
        }
    }

    /// Move to another stored state
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        self.session = self.session.transition(next)?;
        tracing::info!("Session state: {}", self.session);
        Ok(())
    }

    /// Clear everything scoped to a connection
    pub fn reset_connection(&mut self) {
        self.flow.reset();
        self.flow.end_sequence();
        self.history.clear();
        self.priority.clear();
        self.cursor = None;
        self.replay = None;
        self.fault = None;
        self.ready = false;
    }

    /// Enter `Streaming` with a fresh cursor and empty history
    pub fn begin_stream(&mut self, source_length: u64) -> Result<(), SessionError> {
        self.transition(SessionState::Streaming)?;
        self.cursor = Some(StreamCursor::new(source_length));
        self.flow.reset();
        self.flow.begin_sequence();
        self.history.clear();
        self.replay = None;
        self.fault = None;
        self.progress = StreamProgress::new(source_length);
        self.frames_sent = 0;
        self.frames_replayed = 0;
        Ok(())
    }

    /// Discard stream-scoped data
    ///
    /// Flow counts survive: frames already on the wire still hold slots.
    pub fn end_stream(&mut self) {
        self.cursor = None;
        self.replay = None;
        self.fault = None;
        self.history.clear();
        self.flow.end_sequence();
    }

    /// Apply an acknowledgement, returning any report that rode along
    pub fn on_ack(&mut self, ack: Acknowledgement) -> Option<String> {
        self.flow.on_ack(&ack);

        if let (Some(acked), true) = (ack.last_acked, self.flow.is_sequenced()) {
            let limit = match self.replay {
                Some(replay) if self.is_resending() => acked.min(replay.next.saturating_sub(1)),
                _ => acked,
            };
            self.history.retire_up_to(limit);
        }

        if let Some(replay) = self.replay.as_mut() {
            let covered = match ack.last_acked {
                Some(acked) => acked >= replay.origin,
                None => replay.next > replay.origin,
            };
            replay.acknowledged |= covered;
        }

        ack.report
    }

    /// Decide what a resend request means for the running stream
    ///
    /// A fatal outcome is also parked in `fault` for the writer to act on.
    pub fn on_resend(&mut self, request: ResendRequest) -> ResendDisposition {
        let Some(cursor) = self.cursor else {
            return ResendDisposition::Ignored;
        };
        let target = request.from_sequence;

        let disposition = match self.replay {
            Some(replay) if self.is_resending() || replay.is_open() => {
                if target >= replay.origin {
                    ResendDisposition::Fatal(ProtocolError::RepeatedResend {
                        first: replay.origin,
                        repeated: target,
                    })
                } else if !self.history.contains(target) {
                    ResendDisposition::Fatal(ProtocolError::MissingHistory { sequence: target })
                } else {
                    ResendDisposition::Restarted
                }
            }
            _ if target == 0 || target >= cursor.next_sequence => ResendDisposition::Ignored,
            _ if !self.history.contains(target) => {
                ResendDisposition::Fatal(ProtocolError::MissingHistory { sequence: target })
            }
            _ => ResendDisposition::Accepted,
        };

        match &disposition {
            ResendDisposition::Accepted | ResendDisposition::Restarted => {
                self.replay = Some(Replay::starting_at(target));
                self.flow.reset();
            }
            ResendDisposition::Fatal(error) => self.fault = Some(error.clone()),
            ResendDisposition::Ignored => {}
        }

        disposition
    }

    /// Pick and account for the next frame
    ///
    /// `lookahead` holds the next bulk payload, already comment-stripped and
    /// non-empty; it is consumed only when selected.
    pub fn select(&mut self, lookahead: &mut Option<String>) -> Result<Selection, ProtocolError> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }

        if self.is_resending() {
            return self.select_replay();
        }

        let bulk_ready = self.cursor.is_some() && lookahead.is_some();
        if self.priority.is_empty() && !bulk_ready {
            return Ok(Selection::Idle);
        }
        if !self.flow.can_send() {
            return Ok(Selection::Blocked);
        }

        while let Some(command) = self.priority.pop_front() {
            if let Some(frame) = self.frame_next(&command) {
                return Ok(Selection::Priority(frame));
            }
        }

        if let Some(payload) = lookahead.take().filter(|_| self.cursor.is_some()) {
            if let Some(frame) = self.frame_next(&payload) {
                if let Some(cursor) = self.cursor.as_mut() {
                    cursor.next_source_index += 1;
                }
                return Ok(Selection::Bulk(frame));
            }
        }

        Ok(Selection::Idle)
    }

    fn select_replay(&mut self) -> Result<Selection, ProtocolError> {
        if !self.flow.can_send() {
            return Ok(Selection::Blocked);
        }
        let Some(replay) = self.replay.as_mut() else {
            return Ok(Selection::Idle);
        };

        let sequence = replay.next;
        let wire = self
            .history
            .lookup(sequence)
            .map(str::to_string)
            .ok_or(ProtocolError::MissingHistory { sequence })?;
        replay.next += 1;

        self.flow.on_send(Some(sequence));
        self.frames_replayed += 1;
        Ok(Selection::Replay { sequence, wire })
    }

    /// Frame a command, numbering and recording it while a stream runs
    fn frame_next(&mut self, command: &str) -> Option<Frame> {
        match self.cursor.as_mut() {
            Some(cursor) => {
                let probe = Frame::encode(Some(cursor.next_sequence), command)?;
                let sequence = cursor.take_sequence();
                self.history.record(sequence, probe.to_wire());
                self.flow.on_send(Some(sequence));
                self.frames_sent += 1;
                Some(probe)
            }
            None => {
                let frame = Frame::encode(None, command)?;
                self.flow.on_send(None);
                Some(frame)
            }
        }
    }
}
