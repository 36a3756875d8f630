//! # Configuration Management
//!
//! Settings for the client network core: where the relay (connect) server lives,
//! which protocol generation the game server speaks, timeouts, routing
//! suppressions and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment overrides via `from_env()`
//! - Direct instantiation with defaults

use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{RoutingMode, NO_SUB_CODE};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default relay server port
pub const DEFAULT_CONNECT_SERVER_PORT: u16 = 44405;

/// Negotiated wire generation of the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[default]
    Season6,
    V075,
}

impl ProtocolVersion {
    /// Main code of the walk request and its acknowledgement
    pub fn walk_code(self) -> u8 {
        match self {
            ProtocolVersion::Season6 => 0xD4,
            ProtocolVersion::V075 => 0x10,
        }
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "season6" | "s6" => Ok(ProtocolVersion::Season6),
            "v075" | "075" | "0.75" => Ok(ProtocolVersion::V075),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown protocol version: {other}"
            ))),
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClientSettings {
    #[serde(default)]
    pub connect_server: ConnectServerConfig,

    #[serde(default)]
    pub game: GameConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientSettings {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `MU_CLIENT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("MU_CLIENT_HOST") {
            config.connect_server.host = host;
        }

        if let Ok(port) = std::env::var("MU_CLIENT_PORT") {
            config.connect_server.port = port
                .parse::<u16>()
                .map_err(|e| ProtocolError::ConfigError(format!("Invalid MU_CLIENT_PORT: {e}")))?;
        }

        if let Ok(version) = std::env::var("MU_CLIENT_PROTOCOL") {
            config.game.protocol_version = version.parse()?;
        }

        if let Ok(timeout) = std::env::var("MU_CLIENT_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.timeouts.connect = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration. An empty list means it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connect_server.validate());
        errors.extend(self.game.validate());
        errors.extend(self.timeouts.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Relay (connect) server location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ConnectServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: DEFAULT_CONNECT_SERVER_PORT,
        }
    }
}

impl ConnectServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.host.trim().is_empty() {
            errors.push("Connect server host cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("Connect server port cannot be 0".to_string());
        }
        errors
    }
}

/// Game server protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GameConfig {
    pub protocol_version: ProtocolVersion,

    /// Five ASCII digits sent with the login request
    pub client_version: String,

    /// Client serial sent with the login request (at most 16 bytes)
    pub client_serial: String,

    /// Wrap the game server connection in the cipher pipeline
    pub use_encryption: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::Season6,
            client_version: String::from("10525"),
            client_serial: String::from("k1Pk2jcET48mxL3b"),
            use_encryption: true,
        }
    }
}

impl GameConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.client_version.len() != 5 || !self.client_version.is_ascii() {
            errors.push(format!(
                "Client version must be exactly 5 ASCII characters, got '{}'",
                self.client_version
            ));
        }
        if self.client_serial.len() > crate::core::builder::SERIAL_LENGTH {
            errors.push(format!(
                "Client serial too long: {} bytes (maximum: {})",
                self.client_serial.len(),
                crate::core::builder::SERIAL_LENGTH
            ));
        }
        errors
    }

    /// Client version as the fixed 5-byte wire field
    pub fn client_version_bytes(&self) -> [u8; 5] {
        let mut out = [0u8; 5];
        for (dst, src) in out.iter_mut().zip(self.client_version.bytes()) {
            *dst = src;
        }
        out
    }
}

/// Connect and disconnect bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Upper bound for resolving and opening a transport
    #[serde(with = "duration_serde")]
    pub connect: Duration,

    /// How long a disconnect waits for the receive loop to acknowledge cancellation
    #[serde(with = "duration_serde")]
    pub disconnect_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: timeout::CONNECT_TIMEOUT,
            disconnect_grace: timeout::DISCONNECT_GRACE,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.connect.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect.as_secs() > 120 {
            errors.push("Connect timeout too long (maximum: 120s)".to_string());
        }
        if self.disconnect_grace.as_secs() > 10 {
            errors.push("Disconnect grace period too long (maximum: 10s)".to_string());
        }
        errors
    }
}

/// A packet type that is dropped before dispatch without logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SuppressedPacket {
    pub mode: RoutingMode,
    pub code: u8,
    /// `None` matches packets without a sub-code
    #[serde(default)]
    pub sub_code: Option<u8>,
}

impl SuppressedPacket {
    /// Sub-code in handler-key form
    pub fn key_sub_code(&self) -> u8 {
        self.sub_code.unwrap_or(NO_SUB_CODE)
    }
}

/// Router tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    pub suppressed_packets: Vec<SuppressedPacket>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        // Hit-info and animation spam arrive many times per second and have no handler
        Self {
            suppressed_packets: vec![
                SuppressedPacket {
                    mode: RoutingMode::Gameplay,
                    code: 0x11,
                    sub_code: None,
                },
                SuppressedPacket {
                    mode: RoutingMode::Gameplay,
                    code: 0x18,
                    sub_code: None,
                },
            ],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level, overridable through `RUST_LOG`
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mu-client-net"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }
        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
