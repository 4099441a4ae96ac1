//! Frame codec for the Marlin line protocol
//!
//! Outbound, a sequenced command travels as `N<seq> <command>*<checksum>\n`,
//! where the checksum is the XOR of every byte before the `*`. Unsequenced
//! commands travel bare.
//!
//! Inbound, each line is one of:
//! - an acknowledgement: `ok`, optionally followed by `N<seq> P<plan> B<buffers>`
//! - a resend request: `Resend: <seq>` or `rs <seq>`
//! - anything else, which is informational and forwarded verbatim

use serde::{Deserialize, Serialize};

/// Starts a comment that runs to end of line
pub const COMMENT_MARKER: char = ';';

/// Separates the frame prefix from its checksum
pub const CHECKSUM_SEPARATOR: char = '*';

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Code on the first line of `line`, without comment or trailing whitespace
pub fn strip_comment(line: &str) -> &str {
    let code = match line.find([COMMENT_MARKER, '\n', '\r']) {
        Some(idx) => &line[..idx],
        None => line,
    };
    code.trim_end()
}

/// Non-empty commands in a block of text, one per line
pub fn command_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(strip_comment).filter(|code| !code.is_empty())
}

/// One outbound command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Line number, absent for bare commands
    pub sequence: Option<u64>,
    /// Command text, comment-free
    pub payload: String,
    /// XOR over the frame prefix
    pub checksum: u8,
}

impl Frame {
    /// Build a frame from a source line
    ///
    /// Returns `None` when nothing but comment or whitespace remains, so
    /// callers never spend a sequence number on an empty line.
    pub fn encode(sequence: Option<u64>, line: &str) -> Option<Frame> {
        let payload = strip_comment(line);
        if payload.is_empty() {
            return None;
        }

        let prefix = Self::prefix_for(sequence, payload);
        Some(Frame {
            sequence,
            payload: payload.to_string(),
            checksum: checksum(prefix.as_bytes()),
        })
    }

    fn prefix_for(sequence: Option<u64>, payload: &str) -> String {
        match sequence {
            Some(seq) => format!("N{} {}", seq, payload),
            None => payload.to_string(),
        }
    }

    /// The checksummed part of the frame
    pub fn prefix(&self) -> String {
        Self::prefix_for(self.sequence, &self.payload)
    }

    /// Bytes as transmitted, including the newline
    pub fn to_wire(&self) -> String {
        match self.sequence {
            Some(_) => format!(
                "{}{}{}\n",
                self.prefix(),
                CHECKSUM_SEPARATOR,
                self.checksum
            ),
            None => format!("{}\n", self.payload),
        }
    }

    /// Parse a transmitted line back into a frame, as the firmware would
    ///
    /// The returned checksum is the one carried on the wire; compare it with
    /// [`Frame::is_intact`] to detect corruption.
    pub fn from_wire(line: &str) -> Option<Frame> {
        let line = line.trim_end_matches(['\r', '\n']);

        if !line.starts_with('N') {
            return Some(Frame {
                sequence: None,
                payload: line.to_string(),
                checksum: checksum(line.as_bytes()),
            });
        }

        let (prefix, sum) = line.rsplit_once(CHECKSUM_SEPARATOR)?;
        let (seq, payload) = prefix[1..].split_once(' ')?;

        Some(Frame {
            sequence: Some(seq.parse().ok()?),
            payload: payload.to_string(),
            checksum: sum.trim().parse().ok()?,
        })
    }

    /// Whether the carried checksum matches the prefix
    pub fn is_intact(&self) -> bool {
        self.checksum == checksum(self.prefix().as_bytes())
    }
}

/// Acknowledgement from the firmware
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Last line number the firmware processed (`N`)
    pub last_acked: Option<u64>,
    /// Free planner slots (`P`)
    pub plan_buffer_free: Option<u32>,
    /// Free input buffer slots (`B`)
    pub input_buffers_free: Option<u32>,
    /// Trailing text that is not an acknowledgement field, e.g. a temperature report
    pub report: Option<String>,
}

impl Acknowledgement {
    /// An `ok` with no fields
    pub fn bare() -> Self {
        Self::default()
    }

    /// Whether this ack carries the last processed line number
    pub fn is_extended(&self) -> bool {
        self.last_acked.is_some()
    }
}

/// Request to retransmit from a line number onward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    /// First line number to retransmit
    pub from_sequence: u64,
}

/// A classified inbound line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inbound {
    /// `ok`, with or without fields
    Ack(Acknowledgement),
    /// `Resend:`/`rs`
    Resend(ResendRequest),
    /// Anything else
    Info(String),
}

/// Classify an inbound line
///
/// Never fails: a line that almost looks like an acknowledgement or resend
/// degrades to a bare acknowledgement or to informational text.
pub fn decode(line: &str) -> Inbound {
    let text = line.trim();

    if let Some(rest) = strip_marker(text, "ok") {
        return Inbound::Ack(parse_ack_fields(rest));
    }

    for marker in ["resend", "rs"] {
        if let Some(rest) = strip_marker(text, marker) {
            if let Some(from_sequence) = parse_line_number(rest) {
                return Inbound::Resend(ResendRequest { from_sequence });
            }
        }
    }

    Inbound::Info(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Case-insensitive prefix match that refuses to split a word
fn strip_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let head = text.get(..marker.len())?;
    if !head.eq_ignore_ascii_case(marker) {
        return None;
    }
    let rest = &text[marker.len()..];
    match rest.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() => None,
        _ => Some(rest),
    }
}

fn parse_ack_fields(rest: &str) -> Acknowledgement {
    let mut ack = Acknowledgement::bare();
    let mut unrecognized = false;

    for token in rest.split_whitespace() {
        let mut chars = token.chars();
        let field = chars.next().map(|c| c.to_ascii_uppercase());
        let value = chars.as_str();

        match field {
            Some('N') if ack.last_acked.is_none() => match value.parse() {
                Ok(n) => ack.last_acked = Some(n),
                Err(_) => unrecognized = true,
            },
            Some('P') if ack.plan_buffer_free.is_none() => match value.parse() {
                Ok(n) => ack.plan_buffer_free = Some(n),
                Err(_) => unrecognized = true,
            },
            Some('B') if ack.input_buffers_free.is_none() => match value.parse() {
                Ok(n) => ack.input_buffers_free = Some(n),
                Err(_) => unrecognized = true,
            },
            _ => unrecognized = true,
        }
    }

    if unrecognized {
        // a report rides along; the fields are not trustworthy
        ack.last_acked = None;
        ack.plan_buffer_free = None;
        ack.input_buffers_free = None;
        ack.report = Some(rest.trim().to_string());
    }

    ack
}

fn parse_line_number(rest: &str) -> Option<u64> {
    let rest = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    let rest = rest.strip_prefix(['N', 'n']).unwrap_or(rest);
    let digits: &str = &rest[..rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len())];
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_known_frame() {
        let frame = Frame::encode(Some(1), "G28").unwrap();
        assert_eq!(frame.prefix(), "N1 G28");
        assert_eq!(frame.checksum, 18);
        assert_eq!(frame.to_wire(), "N1 G28*18\n");
    }

    #[test]
    fn test_encode_strips_comment_and_whitespace() {
        let frame = Frame::encode(Some(2), "G0 Y10  ; move to the edge").unwrap();
        assert_eq!(frame.payload, "G0 Y10");

        let frame = Frame::encode(Some(2), "G0 Y10\n; comment").unwrap();
        assert_eq!(frame.payload, "G0 Y10");
    }

    #[test]
    fn test_encode_never_spans_lines() {
        let frame = Frame::encode(Some(2), "G0 X3\nG0 X4").unwrap();
        assert_eq!(frame.payload, "G0 X3");
        assert_eq!(frame.to_wire().matches('\n').count(), 1);
    }

    #[test]
    fn test_command_lines_strips_each_line() {
        let lines: Vec<&str> = command_lines("G0 X1 ; a\nG0 X2\r\n\n; only comment\n  M400  ").collect();
        assert_eq!(lines, vec!["G0 X1", "G0 X2", "  M400"]);
        assert_eq!(command_lines("; nothing").count(), 0);
    }

    #[test]
    fn test_encode_skips_empty_lines() {
        assert!(Frame::encode(Some(1), "").is_none());
        assert!(Frame::encode(Some(1), "   \t").is_none());
        assert!(Frame::encode(Some(1), "; just a comment").is_none());
        assert!(Frame::encode(None, "  ;").is_none());
    }

    #[test]
    fn test_bare_frame_has_no_envelope() {
        let frame = Frame::encode(None, "M110 N0").unwrap();
        assert_eq!(frame.to_wire(), "M110 N0\n");
        assert_eq!(frame.sequence, None);
    }

    #[test]
    fn test_from_wire_round_trip() {
        let frame = Frame::encode(Some(42), "M104 S200 T0").unwrap();
        let parsed = Frame::from_wire(&frame.to_wire()).unwrap();
        assert_eq!(parsed, frame);
        assert!(parsed.is_intact());
    }

    #[test]
    fn test_from_wire_detects_corruption() {
        let frame = Frame::encode(Some(3), "G1 X10").unwrap();
        let corrupted = frame.to_wire().replace("X10", "X19");
        let parsed = Frame::from_wire(&corrupted).unwrap();
        assert!(!parsed.is_intact());
    }

    #[test]
    fn test_decode_bare_ack() {
        assert_eq!(decode("ok"), Inbound::Ack(Acknowledgement::bare()));
        assert_eq!(decode("OK\r\n"), Inbound::Ack(Acknowledgement::bare()));
    }

    #[test]
    fn test_decode_extended_ack() {
        assert_eq!(
            decode("ok N12 P15 B3"),
            Inbound::Ack(Acknowledgement {
                last_acked: Some(12),
                plan_buffer_free: Some(15),
                input_buffers_free: Some(3),
                report: None,
            })
        );
        assert_eq!(
            decode("ok N7"),
            Inbound::Ack(Acknowledgement {
                last_acked: Some(7),
                ..Acknowledgement::bare()
            })
        );
    }

    #[test]
    fn test_decode_malformed_ack_falls_back_to_bare() {
        let Inbound::Ack(ack) = decode("ok Nxx P15") else {
            panic!("expected ack");
        };
        assert!(!ack.is_extended());
        assert_eq!(ack.report.as_deref(), Some("Nxx P15"));
    }

    #[test]
    fn test_decode_ack_with_temperature_report() {
        let Inbound::Ack(ack) = decode("ok T:210.0 /210.0 B:60.1 /60.0 @:64") else {
            panic!("expected ack");
        };
        assert!(!ack.is_extended());
        assert_eq!(ack.report.as_deref(), Some("T:210.0 /210.0 B:60.1 /60.0 @:64"));
    }

    #[test]
    fn test_decode_resend_variants() {
        let expected = Inbound::Resend(ResendRequest { from_sequence: 2 });
        assert_eq!(decode("Resend: 2"), expected);
        assert_eq!(decode("resend:2"), expected);
        assert_eq!(decode("RESEND: N2"), expected);
        assert_eq!(decode("rs 2"), expected);
        assert_eq!(decode("rs N2"), expected);
    }

    #[test]
    fn test_decode_informational() {
        assert_eq!(
            decode("echo:busy: processing"),
            Inbound::Info("echo:busy: processing".into())
        );
        // looks like markers but is not
        assert_eq!(decode("okay then"), Inbound::Info("okay then".into()));
        assert_eq!(decode("rsync"), Inbound::Info("rsync".into()));
        assert_eq!(decode("Resend: soon"), Inbound::Info("Resend: soon".into()));
        assert_eq!(
            decode("Error:checksum mismatch, Last Line: 1"),
            Inbound::Info("Error:checksum mismatch, Last Line: 1".into())
        );
    }
}
