//! Flow control against the firmware's input buffer
//!
//! Tracks how many frames are in flight and how much room the firmware last
//! reported. A frame may go out only while `input_buffers_free > pending`.

use super::codec::Acknowledgement;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Snapshot of the flow counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// Frames sent and not yet acknowledged
    pub pending: u32,
    /// Free planner slots last reported by the firmware
    pub plan_buffer_free: u32,
    /// Free input buffer slots last reported by the firmware
    pub input_buffers_free: u32,
}

/// Flow control tracker
///
/// Owned by the session's shared transport state; the reader applies acks
/// and the active writer records sends, both under the same lock.
#[derive(Debug, Clone)]
pub struct FlowTracker {
    state: FlowState,
    input_capacity: u32,
    plan_capacity: u32,
    /// Sequence of the most recently transmitted numbered frame
    last_sent: u64,
    /// Extended acks carry meaningful line numbers only for numbered frames
    sequenced: bool,
    last_ack_at: Instant,
}

impl FlowTracker {
    /// Create a tracker for a firmware with the given buffer sizes
    pub fn new(input_capacity: u32, plan_capacity: u32) -> Self {
        Self {
            state: FlowState {
                pending: 0,
                plan_buffer_free: plan_capacity,
                input_buffers_free: input_capacity,
            },
            input_capacity,
            plan_capacity,
            last_sent: 0,
            sequenced: false,
            last_ack_at: Instant::now(),
        }
    }

    /// Current counters
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Frames in flight
    pub fn pending(&self) -> u32 {
        self.state.pending
    }

    /// Whether a frame may be transmitted now
    pub fn can_send(&self) -> bool {
        self.state.input_buffers_free > self.state.pending
    }

    /// Record a transmitted frame
    pub fn on_send(&mut self, sequence: Option<u64>) {
        if self.state.pending == 0 {
            // stall timer starts with the first frame in flight
            self.last_ack_at = Instant::now();
        }
        self.state.pending = self.state.pending.saturating_add(1);
        if let Some(sequence) = sequence {
            self.last_sent = sequence;
        }
    }

    /// Apply an acknowledgement
    ///
    /// An extended ack replaces `pending` with `last_sent - last_acked`,
    /// absorbing any acks the link dropped. A bare ack retires one frame.
    pub fn on_ack(&mut self, ack: &Acknowledgement) {
        match ack.last_acked {
            Some(acked) if self.sequenced => {
                let outstanding = self.last_sent.saturating_sub(acked);
                self.state.pending = u32::try_from(outstanding).unwrap_or(u32::MAX);
            }
            _ => self.state.pending = self.state.pending.saturating_sub(1),
        }

        if let Some(plan) = ack.plan_buffer_free {
            self.state.plan_buffer_free = plan;
        }
        if let Some(free) = ack.input_buffers_free {
            // frames already in flight hold their slots
            self.state.input_buffers_free = free.max(self.state.pending);
        }

        self.last_ack_at = Instant::now();
    }

    /// Forget everything in flight and assume an empty firmware buffer
    pub fn reset(&mut self) {
        self.state = FlowState {
            pending: 0,
            plan_buffer_free: self.plan_capacity,
            input_buffers_free: self.input_capacity,
        };
        self.last_ack_at = Instant::now();
    }

    /// Enter numbered mode; extended acks are reconciled from here on
    pub fn begin_sequence(&mut self) {
        self.sequenced = true;
        self.last_sent = 0;
    }

    /// Leave numbered mode
    pub fn end_sequence(&mut self) {
        self.sequenced = false;
    }

    /// Whether extended acks are being reconciled
    pub fn is_sequenced(&self) -> bool {
        self.sequenced
    }

    /// Sequence of the most recently transmitted numbered frame
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    /// How long frames have been waiting without any acknowledgement
    ///
    /// `None` when nothing is in flight.
    pub fn ack_wait(&self) -> Option<Duration> {
        (self.state.pending > 0).then(|| self.last_ack_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extended(n: u64) -> Acknowledgement {
        Acknowledgement {
            last_acked: Some(n),
            ..Acknowledgement::bare()
        }
    }

    #[test]
    fn test_gate_closes_at_capacity() {
        let mut flow = FlowTracker::new(4, 16);
        for _ in 0..4 {
            assert!(flow.can_send());
            flow.on_send(None);
        }
        assert!(!flow.can_send());
        assert_eq!(flow.pending(), 4);

        flow.on_ack(&Acknowledgement::bare());
        assert!(flow.can_send());
        assert_eq!(flow.pending(), 3);
    }

    #[test]
    fn test_bare_ack_never_underflows() {
        let mut flow = FlowTracker::new(4, 16);
        flow.on_ack(&Acknowledgement::bare());
        flow.on_ack(&Acknowledgement::bare());
        assert_eq!(flow.pending(), 0);
    }

    #[test]
    fn test_extended_ack_reconciles_dropped_acks() {
        let mut flow = FlowTracker::new(8, 16);
        flow.begin_sequence();
        for seq in 1..=5 {
            flow.on_send(Some(seq));
        }
        // acks for 1 and 2 were lost on the wire
        flow.on_ack(&extended(3));
        assert_eq!(flow.pending(), 2);

        flow.on_ack(&extended(9));
        assert_eq!(flow.pending(), 0);
    }

    #[test]
    fn test_extended_ack_outside_sequence_counts_as_bare() {
        let mut flow = FlowTracker::new(4, 16);
        flow.on_send(None);
        flow.on_send(None);
        // the firmware still reports the last numbered line it saw
        flow.on_ack(&extended(120));
        assert_eq!(flow.pending(), 1);
    }

    #[test]
    fn test_reported_buffers_update_counts() {
        let mut flow = FlowTracker::new(4, 16);
        flow.begin_sequence();
        flow.on_send(Some(1));
        flow.on_send(Some(2));
        flow.on_ack(&Acknowledgement {
            last_acked: Some(1),
            plan_buffer_free: Some(12),
            input_buffers_free: Some(2),
            report: None,
        });
        let state = flow.state();
        assert_eq!(state.pending, 1);
        assert_eq!(state.plan_buffer_free, 12);
        assert_eq!(state.input_buffers_free, 2);
        assert!(flow.can_send());

        flow.reset();
        assert_eq!(
            flow.state(),
            FlowState {
                pending: 0,
                plan_buffer_free: 16,
                input_buffers_free: 4,
            }
        );
    }

    #[test]
    fn test_ack_wait_only_while_in_flight() {
        let mut flow = FlowTracker::new(4, 16);
        assert!(flow.ack_wait().is_none());
        flow.on_send(None);
        assert!(flow.ack_wait().is_some());
        flow.on_ack(&Acknowledgement::bare());
        assert!(flow.ack_wait().is_none());
    }
}
