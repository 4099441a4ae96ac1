//! Send history for resend replay
//!
//! Holds the exact bytes of every numbered frame put on the wire during the
//! current stream, so a resend retransmits them unchanged.

use std::collections::BTreeMap;

/// Transmitted frames keyed by sequence number
#[derive(Debug, Clone, Default)]
pub struct History {
    frames: BTreeMap<u64, String>,
}

impl History {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the wire form of a transmitted frame
    pub fn record(&mut self, sequence: u64, wire: impl Into<String>) {
        self.frames.insert(sequence, wire.into());
    }

    /// Wire form of a previously transmitted frame
    pub fn lookup(&self, sequence: u64) -> Option<&str> {
        self.frames.get(&sequence).map(String::as_str)
    }

    /// Whether a sequence is still held
    pub fn contains(&self, sequence: u64) -> bool {
        self.frames.contains_key(&sequence)
    }

    /// Drop every entry at or below `sequence`
    pub fn retire_up_to(&mut self, sequence: u64) {
        self.frames = self.frames.split_off(&sequence.saturating_add(1));
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Lowest sequence still held
    pub fn oldest(&self) -> Option<u64> {
        self.frames.keys().next().copied()
    }
}
