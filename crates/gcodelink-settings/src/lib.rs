//! gcodelink Settings Crate
//!
//! Loads, validates and saves the host configuration, and turns it into the
//! parameters the transport engine runs with.

pub mod config;
pub mod error;

pub use config::{Config, ConnectionSettings, StartupSettings, TransportSettings};
pub use error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
