//! Configuration management for SessionLink
//!
//! Defaults, TOML files and `SESSIONLINK_<SECTION>_<KEY>` environment variables,
//! followed by validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Wire protocol version advertised in phase-1 payloads
pub const PROTOCOL_VERSION: u32 = 1;

/// Main protocol configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Key exchange handshake configuration
    pub handshake: HandshakeConfig,

    /// Channel router configuration
    pub router: RouterConfig,

    /// Typing/presence configuration
    pub presence: PresenceConfig,

    /// Session actor configuration
    pub session: SessionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Key exchange handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// How long a request may stay unanswered before it expires
    #[serde(with = "humantime_serde")]
    pub request_ttl: Duration,

    /// Version number written into phase-1 payloads
    pub protocol_version: u32,
}

/// Channel router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum number of remembered event fingerprints
    pub dedup_capacity: usize,

    /// Fingerprints older than this are forgotten
    #[serde(with = "humantime_serde")]
    pub dedup_horizon: Duration,
}

/// Typing/presence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// A typing indicator without refresh resets after this window
    #[serde(with = "humantime_serde")]
    pub typing_idle_timeout: Duration,
}

/// Session actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name sent during the user data exchange
    pub display_name: String,

    /// Capacity of the command channel into the session loop
    pub command_buffer: usize,

    /// Capacity of the change-event broadcast channel
    pub event_buffer: usize,

    /// Capacity of the inbound transport queue
    pub inbound_buffer: usize,

    /// Interval of the expiry housekeeping tick
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 10_000,
            dedup_horizon: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_idle_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            command_buffer: 100,
            event_buffer: 256,
            inbound_buffer: 1024,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

/// Read `name` from the environment and parse it, if present
fn env_parse<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Read a humantime duration (`30s`, `5m`) from the environment
fn env_duration(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Environment variables follow the pattern: SESSIONLINK_<SECTION>_<KEY>
    /// Example: SESSIONLINK_ROUTER_DEDUP_HORIZON=10m
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(ttl) = env_duration("SESSIONLINK_HANDSHAKE_REQUEST_TTL")? {
            self.handshake.request_ttl = ttl;
        }
        if let Some(capacity) = env_parse("SESSIONLINK_ROUTER_DEDUP_CAPACITY")? {
            self.router.dedup_capacity = capacity;
        }
        if let Some(horizon) = env_duration("SESSIONLINK_ROUTER_DEDUP_HORIZON")? {
            self.router.dedup_horizon = horizon;
        }
        if let Some(idle) = env_duration("SESSIONLINK_PRESENCE_TYPING_IDLE_TIMEOUT")? {
            self.presence.typing_idle_timeout = idle;
        }
        if let Ok(name) = env::var("SESSIONLINK_SESSION_DISPLAY_NAME") {
            self.session.display_name = name;
        }
        if let Some(tick) = env_duration("SESSIONLINK_SESSION_TICK_INTERVAL")? {
            self.session.tick_interval = tick;
        }
        if let Ok(level) = env::var("SESSIONLINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = env_parse("SESSIONLINK_LOG_JSON")? {
            self.logging.json_format = json;
        }
        Ok(())
    }

    /// Load configuration from a TOML file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake.request_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "handshake.request_ttl must be greater than 0".to_string(),
            ));
        }

        if self.handshake.protocol_version == 0 {
            return Err(ConfigError::ValidationFailed(
                "handshake.protocol_version must be greater than 0".to_string(),
            ));
        }

        if self.router.dedup_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "router.dedup_capacity must be greater than 0".to_string(),
            ));
        }

        if self.router.dedup_horizon.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "router.dedup_horizon must be greater than 0".to_string(),
            ));
        }

        if self.presence.typing_idle_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "presence.typing_idle_timeout must be greater than 0".to_string(),
            ));
        }

        if self.session.command_buffer == 0
            || self.session.event_buffer == 0
            || self.session.inbound_buffer == 0
        {
            return Err(ConfigError::ValidationFailed(
                "session buffers must be greater than 0".to_string(),
            ));
        }

        if self.session.tick_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "session.tick_interval must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|source| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}
