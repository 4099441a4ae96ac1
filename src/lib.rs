//! # gcodelink
//!
//! A headless host that streams G-code to Marlin firmware over a serial link.
//!
//! ## Architecture
//!
//! gcodelink is organized as a workspace with multiple crates:
//!
//! 1. **gcodelink-core** - Error taxonomy, session states, sinks and events
//! 2. **gcodelink-communication** - Serial channel, framing, flow control, resend and the session engine
//! 3. **gcodelink-settings** - Persisted configuration
//! 4. **gcodelink** - Console host binary that ties them together

pub mod console;

pub use console::{Control, HostCommand};

pub use gcodelink_communication::{
    list_ports, ConnectionParams, FileSource, SerialConnector, Session, TransportConfig,
};
pub use gcodelink_core::{Error, EventDispatcher, Result, SessionEvent, SessionState};
pub use gcodelink_settings::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Log output style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line human readable records
    #[default]
    Pretty,
    /// One JSON object per record
    Json,
}

/// Initialize logging
///
/// Sets up structured logging with:
/// - Output on stderr, leaving stdout to the console
/// - RUST_LOG environment variable support, INFO by default
pub fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_thread_names(true)
                .with_line_number(true)
                .pretty();
            registry.with(fmt_layer).try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true);
            registry.with(fmt_layer).try_init()?;
        }
    }

    Ok(())
}
