//! Console commands
//!
//! Lines starting with `!` control the host; anything else goes to the
//! firmware as an interactive command.

use anyhow::{bail, Context};
use gcodelink_communication::{FileSource, Session};
use gcodelink_core::{Error, SessionError};
use std::path::PathBuf;

/// Prefix marking a host command
pub const HOST_PREFIX: char = '!';

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Stream a file
    Print(PathBuf),
    /// Stop the running stream
    Abort,
    /// Queue the motors-off command
    MotorsOff,
    /// Show session state, buffers and progress
    Status,
    /// Close the port
    Disconnect,
    /// Open the port
    Connect,
    /// Leave the console
    Quit,
    /// Send to the firmware as typed
    Send(String),
    /// Blank line
    Empty,
}

/// What the console loop does after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Quit,
}

impl HostCommand {
    /// Parse one console line
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(rest) = line.strip_prefix(HOST_PREFIX) else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "print" => {
                if argument.is_empty() {
                    bail!("Usage: !print <file>");
                }
                Self::Print(PathBuf::from(argument))
            }
            "abort" => Self::Abort,
            "motors-off" => Self::MotorsOff,
            "status" => Self::Status,
            "disconnect" => Self::Disconnect,
            "connect" => Self::Connect,
            "quit" | "exit" => Self::Quit,
            other => bail!("Unknown host command: !{}", other),
        };
        Ok(command)
    }
}

/// Run a parsed command against the session
pub async fn execute(session: &Session, command: HostCommand) -> anyhow::Result<Control> {
    match command {
        HostCommand::Empty => {}
        HostCommand::Send(text) => session.send_command(&text)?,
        HostCommand::Print(path) => {
            let source = FileSource::open(&path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            tracing::info!("Printing {}", path.display());
            session.start_stream(Box::new(source)).await?;
        }
        HostCommand::Abort => session.abort_stream().await?,
        HostCommand::MotorsOff => session.motors_off()?,
        HostCommand::Status => println!("{}", status_line(session)),
        HostCommand::Connect => session.connect().await?,
        HostCommand::Disconnect => session.disconnect().await?,
        HostCommand::Quit => {
            match session.disconnect().await {
                Ok(()) | Err(Error::Session(SessionError::NotConnected)) => {}
                Err(e) => tracing::warn!("Disconnect on quit failed: {}", e),
            }
            return Ok(Control::Quit);
        }
    }
    Ok(Control::Continue)
}

/// One-line summary of the session
pub fn status_line(session: &Session) -> String {
    let state = session.state();
    let flow = session.flow_state();
    let mut line = format!(
        "{} | pending {} | input free {} | planner free {}",
        state, flow.pending, flow.input_buffers_free, flow.plan_buffer_free
    );
    if state.is_streaming() {
        let bar = session.progress().render_bar(30);
        if !bar.is_empty() {
            line.push_str(" | ");
            line.push_str(&bar);
        }
    }
    if let Some(report) = session.last_report() {
        line.push_str(" | last: ");
        line.push_str(&report.to_string());
    }
    line
}
