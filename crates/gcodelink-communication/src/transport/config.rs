//! Transport tuning

use std::time::Duration;

/// Timing, buffer sizes and startup behaviour of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Firmware input buffer size (Marlin `BUFSIZE`)
    pub input_buffer_slots: u32,
    /// Firmware planner buffer size
    pub plan_buffer_slots: u32,
    /// Bounded wait while blocked on backpressure or idle
    pub poll_interval: Duration,
    /// Transient write failures tolerated before the channel is declared lost
    pub max_io_retries: u32,
    /// First retry delay, doubled on each further attempt
    pub retry_backoff: Duration,
    /// Warn once when frames wait this long without any acknowledgement
    pub ack_stall_warning: Duration,
    /// Sent bare before every stream to restart firmware line numbering
    pub line_reset_command: String,
    /// Upper-case commands before framing
    pub uppercase_commands: bool,
    /// Queued once the firmware announces it is ready
    pub startup_commands: Vec<String>,
    /// Informational line prefixes announcing readiness
    pub ready_markers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            input_buffer_slots: 4,
            plan_buffer_slots: 16,
            poll_interval: Duration::from_millis(5),
            max_io_retries: 5,
            retry_backoff: Duration::from_millis(20),
            ack_stall_warning: Duration::from_secs(10),
            line_reset_command: "M110 N0".to_string(),
            uppercase_commands: false,
            startup_commands: vec![
                "M154 S5".to_string(),
                "M155 S5".to_string(),
                "M302 P1".to_string(),
            ],
            ready_markers: vec!["echo:M217".to_string(), "echo:SD init".to_string()],
        }
    }
}

impl TransportConfig {
    /// Apply the configured case folding to a command
    pub fn prepare(&self, command: &str) -> String {
        if self.uppercase_commands {
            command.to_uppercase()
        } else {
            command.to_string()
        }
    }

    /// Whether an informational line announces readiness
    ///
    /// Matches a marker as a prefix, ignoring case and whitespace.
    pub fn is_ready_line(&self, line: &str) -> bool {
        let line = squash(line);
        self.ready_markers
            .iter()
            .map(|marker| squash(marker))
            .any(|marker| !marker.is_empty() && line.starts_with(&marker))
    }
}

fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
