//! Session state machine types
//!
//! ```text
//! Disconnected -> Idle -> Streaming <-> Resending
//!                  ^         |              |
//!                  |         v              v
//!                  +---- Finalizing <-------+
//!                  |         |
//!                  +---- Aborting <- (Streaming | Resending | Finalizing)
//! ```
//!
//! Any state may drop to `Disconnected`.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No channel open
    #[default]
    Disconnected,
    /// Connected, interactive traffic only
    Idle,
    /// Bulk stream active
    Streaming,
    /// Replaying history after a resend request
    Resending,
    /// Stream source exhausted, draining acknowledgements
    Finalizing,
    /// Stream cancelled, transmission halting
    Aborting,
}

impl SessionState {
    /// Whether a bulk stream owns the writer in this state
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            SessionState::Streaming | SessionState::Resending | SessionState::Finalizing
        )
    }

    /// Whether a channel is open in this state
    pub fn is_connected(self) -> bool {
        self != SessionState::Disconnected
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Disconnected {
            return self != Disconnected;
        }

        matches!(
            (self, next),
            (Disconnected, Idle)
                | (Idle, Streaming)
                | (Streaming, Resending)
                | (Resending, Streaming)
                | (Streaming, Finalizing)
                | (Resending, Finalizing)
                | (Finalizing, Resending)
                | (Finalizing, Idle)
                | (Streaming, Aborting)
                | (Resending, Aborting)
                | (Finalizing, Aborting)
                | (Aborting, Idle)
        )
    }

    /// Validate a transition, producing the session error on violation
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SessionError::InvalidStateTransition {
                current: self.to_string(),
                requested: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Idle => write!(f, "Idle"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Resending => write!(f, "Resending"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Aborting => write!(f, "Aborting"),
        }
    }
}

/// How a stream run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamOutcome {
    /// Source exhausted and every frame acknowledged
    Completed,
    /// Cancelled by the user
    Aborted,
    /// Ended by a protocol desync
    Desynchronized,
    /// Ended because the bulk source could not be read
    SourceFailed,
    /// Ended because the channel went away
    ChannelLost,
}

impl std::fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Desynchronized => write!(f, "desynchronized"),
            Self::SourceFailed => write!(f, "failed reading source"),
            Self::ChannelLost => write!(f, "channel lost"),
        }
    }
}

/// Summary of one stream run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReport {
    /// How the run ended
    pub outcome: StreamOutcome,
    /// Sequenced frames transmitted for the first time
    pub frames_sent: u64,
    /// Frames retransmitted from history
    pub frames_replayed: u64,
    /// When the stream started
    pub started_at: DateTime<Utc>,
    /// When the stream ended
    pub finished_at: DateTime<Utc>,
}

impl StreamReport {
    /// Wall-clock duration of the run
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl std::fmt::Display for StreamReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.elapsed().num_milliseconds() as f64 / 1000.0;
        write!(
            f,
            "Stream {}: {} lines sent, {} resent, {:.1}s",
            self.outcome, self.frames_sent, self.frames_replayed, secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            SessionState::Disconnected,
            SessionState::Idle,
            SessionState::Streaming,
            SessionState::Resending,
            SessionState::Streaming,
            SessionState::Finalizing,
            SessionState::Idle,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_abort_only_from_stream_states() {
        assert!(SessionState::Streaming.can_transition_to(SessionState::Aborting));
        assert!(SessionState::Resending.can_transition_to(SessionState::Aborting));
        assert!(SessionState::Finalizing.can_transition_to(SessionState::Aborting));
        assert!(!SessionState::Idle.can_transition_to(SessionState::Aborting));
        assert!(SessionState::Aborting.can_transition_to(SessionState::Idle));
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        for state in [
            SessionState::Idle,
            SessionState::Streaming,
            SessionState::Resending,
            SessionState::Finalizing,
            SessionState::Aborting,
        ] {
            assert!(state.can_transition_to(SessionState::Disconnected));
        }
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Disconnected));
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = SessionState::Idle
            .transition(SessionState::Finalizing)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidStateTransition {
                current: "Idle".into(),
                requested: "Finalizing".into(),
            }
        );
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Streaming));
    }

    #[test]
    fn test_report_display() {
        let started_at = Utc::now();
        let report = StreamReport {
            outcome: StreamOutcome::Completed,
            frames_sent: 3,
            frames_replayed: 2,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1500),
        };
        assert_eq!(
            report.to_string(),
            "Stream completed: 3 lines sent, 2 resent, 1.5s"
        );
    }
}
