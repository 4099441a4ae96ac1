//! Configuration for gcodelink
//!
//! Supports JSON and TOML files, picked by extension, stored by default in
//! the platform config directory.
//!
//! Configuration is organized into sections:
//! - Connection settings (port, baud rate, read timeout, reset)
//! - Transport settings (firmware buffers, pacing, retries)
//! - Startup settings (readiness markers and the commands they trigger)

use crate::error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
use gcodelink_communication::{ConnectionParams, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "gcodelink";
const CONFIG_FILE: &str = "config.toml";

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial device path or port name
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound for one blocking read, in milliseconds
    pub read_timeout_ms: u64,
    /// Toggle DTR after opening
    pub reset_on_connect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let params = ConnectionParams::default();
        Self {
            port: params.port,
            baud_rate: params.baud_rate,
            read_timeout_ms: params.read_timeout_ms,
            reset_on_connect: params.reset_on_connect,
        }
    }
}

/// Transport tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Firmware input buffer slots (Marlin `BUFSIZE`)
    pub input_buffer_slots: u32,
    /// Firmware planner buffer slots
    pub plan_buffer_slots: u32,
    /// Sleep while blocked or idle, in milliseconds
    pub poll_interval_ms: u64,
    /// Transient I/O failures tolerated before giving up on the port
    pub max_io_retries: u32,
    /// Base retry delay in milliseconds, doubled per retry
    pub retry_backoff_ms: u64,
    /// Warn after this long without an acknowledgement, in milliseconds
    pub ack_stall_warning_ms: u64,
    /// Command that restarts firmware line numbering
    pub line_reset_command: String,
    /// Upper-case everything before sending
    pub uppercase_commands: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            input_buffer_slots: transport.input_buffer_slots,
            plan_buffer_slots: transport.plan_buffer_slots,
            poll_interval_ms: millis(transport.poll_interval),
            max_io_retries: transport.max_io_retries,
            retry_backoff_ms: millis(transport.retry_backoff),
            ack_stall_warning_ms: millis(transport.ack_stall_warning),
            line_reset_command: transport.line_reset_command,
            uppercase_commands: transport.uppercase_commands,
        }
    }
}

/// What happens once the firmware says it is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Queued once per connection when a ready marker is seen
    pub commands: Vec<String>,
    /// Informational line prefixes meaning "firmware ready"
    pub ready_markers: Vec<String>,
}

impl Default for StartupSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            commands: transport.startup_commands,
            ready_markers: transport.ready_markers,
        }
    }
}

/// Complete host configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial connection
    pub connection: ConnectionSettings,
    /// Transport tuning
    pub transport: TransportSettings,
    /// Readiness handling
    pub startup: StartupSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
}

impl Format {
    fn of(path: &Path) -> ConfigResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no config directory on this platform".to_string())
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = Format::of(path)?;
        let content = std::fs::read_to_string(path)?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load config from file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match Format::of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SettingsError::SaveError(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.connection.port.trim().is_empty() {
            return Err(ConfigError::MissingValue("connection.port".to_string()));
        }
        if self.connection.baud_rate == 0 {
            return Err(ConfigError::out_of_range("connection.baud_rate", 0));
        }
        if self.connection.read_timeout_ms == 0 {
            return Err(ConfigError::out_of_range("connection.read_timeout_ms", 0));
        }

        let transport = &self.transport;
        if transport.input_buffer_slots == 0 {
            return Err(ConfigError::out_of_range("transport.input_buffer_slots", 0));
        }
        if transport.plan_buffer_slots == 0 {
            return Err(ConfigError::out_of_range("transport.plan_buffer_slots", 0));
        }
        for (key, value) in [
            ("transport.poll_interval_ms", transport.poll_interval_ms),
            ("transport.retry_backoff_ms", transport.retry_backoff_ms),
            ("transport.ack_stall_warning_ms", transport.ack_stall_warning_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::out_of_range(key, value));
            }
        }
        if transport.line_reset_command.trim().is_empty() {
            return Err(ConfigError::MissingValue(
                "transport.line_reset_command".to_string(),
            ));
        }

        Ok(())
    }

    /// Parameters for opening the serial port
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            port: self.connection.port.clone(),
            baud_rate: self.connection.baud_rate,
            read_timeout_ms: self.connection.read_timeout_ms,
            reset_on_connect: self.connection.reset_on_connect,
        }
    }

    /// Runtime configuration for the transport engine
    pub fn transport_config(&self) -> TransportConfig {
        let transport = &self.transport;
        TransportConfig {
            input_buffer_slots: transport.input_buffer_slots,
            plan_buffer_slots: transport.plan_buffer_slots,
            poll_interval: Duration::from_millis(transport.poll_interval_ms),
            max_io_retries: transport.max_io_retries,
            retry_backoff: Duration::from_millis(transport.retry_backoff_ms),
            ack_stall_warning: Duration::from_millis(transport.ack_stall_warning_ms),
            line_reset_command: transport.line_reset_command.clone(),
            uppercase_commands: transport.uppercase_commands,
            startup_commands: self.startup.commands.clone(),
            ready_markers: self.startup.ready_markers.clone(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_transport_defaults() {
        let config = Config::new();
        assert_eq!(config.connection.port, "/dev/ttyACM0");
        assert_eq!(config.connection.baud_rate, 250_000);
        assert!(config.connection.reset_on_connect);
        assert_eq!(config.transport.line_reset_command, "M110 N0");
        assert_eq!(config.startup.commands, vec!["M154 S5", "M155 S5", "M302 P1"]);
        assert!(config.validate().is_ok());

        let transport = config.transport_config();
        let defaults = TransportConfig::default();
        assert_eq!(transport.input_buffer_slots, defaults.input_buffer_slots);
        assert_eq!(transport.poll_interval, defaults.poll_interval);
        assert_eq!(transport.retry_backoff, defaults.retry_backoff);
        assert_eq!(transport.ack_stall_warning, defaults.ack_stall_warning);
        assert_eq!(transport.ready_markers, defaults.ready_markers);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::new();
        config.connection.baud_rate = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::out_of_range("connection.baud_rate", 0))
        );

        let mut config = Config::new();
        config.transport.input_buffer_slots = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.transport.poll_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::out_of_range("transport.poll_interval_ms", 0))
        );

        let mut config = Config::new();
        config.transport.line_reset_command = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::new();
        config.connection.port = "/dev/ttyUSB1".to_string();
        config.connection.baud_rate = 115_200;
        config.transport.uppercase_commands = true;
        config.startup.commands = vec!["M115".to_string()];
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::new();
        config.transport.input_buffer_slots = 8;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.transport.input_buffer_slots, 8);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection]\nport = \"COM3\"\n").unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.connection.port, "COM3");
        assert_eq!(loaded.connection.baud_rate, 250_000);
        assert_eq!(loaded.transport, TransportSettings::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection]\nbaud_rate = 0\n").unwrap();

        let err = Config::load_from_file(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Config(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let err = Config::new().save_to_file(&path).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Config(ConfigError::UnsupportedFormat(_))
        ));
        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_connection_params_conversion() {
        let mut config = Config::new();
        config.connection.port = "/dev/ttyUSB0".to_string();
        config.connection.read_timeout_ms = 100;
        config.connection.reset_on_connect = false;

        let params = config.connection_params();
        assert_eq!(params.port, "/dev/ttyUSB0");
        assert_eq!(params.read_timeout(), Duration::from_millis(100));
        assert!(!params.reset_on_connect);
    }
}
