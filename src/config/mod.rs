//! Configuration management for memring

use crate::core::{ConnectionOptions, ServerSpec};
use crate::health::Backoff;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
pub const DEFAULT_RING_POINTS_PER_WEIGHT: u32 = 160;

/// Main memring configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache servers as `host[:port[:weight]]`
    pub servers: Vec<String>,
    /// Resubmissions allowed after a recoverable failure
    pub max_retries: u32,
    /// Limit for connect plus handshake, in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-attempt command deadline, in milliseconds
    pub command_timeout_ms: u64,
    /// First reconnect delay after a server goes down, in milliseconds
    pub backoff_initial_ms: u64,
    /// Reconnect delay ceiling, in milliseconds
    pub backoff_max_ms: u64,
    /// Ring points per unit of server weight
    pub ring_points_per_weight: u32,
    /// SASL PLAIN credentials sent on every new connection
    pub credentials: Option<Credentials>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Opaque credentials passed through to the server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:11211".to_string()],
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            ring_points_per_weight: DEFAULT_RING_POINTS_PER_WEIGHT,
            credentials: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Build a configuration for a server list, everything else default
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        self.validate_settings()
    }

    /// Validate everything except the requirement of a non-empty server list
    ///
    /// A client may start with no servers and receive them later through
    /// `Client::configure`.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        let specs = self.server_specs()?;
        let mut labels: Vec<String> = specs.iter().map(ServerSpec::label).collect();
        labels.sort();
        if let Some(pair) = labels.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::ValidationError(format!(
                "Server {} is listed twice",
                pair[0]
            )));
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.command_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.backoff_initial_ms == 0 {
            return Err(ConfigError::ValidationError(
                "backoff_initial_ms must be greater than 0".to_string(),
            ));
        }

        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::ValidationError(
                "backoff_initial_ms must not exceed backoff_max_ms".to_string(),
            ));
        }

        if self.ring_points_per_weight == 0 {
            return Err(ConfigError::ValidationError(
                "ring_points_per_weight must be greater than 0".to_string(),
            ));
        }

        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(ConfigError::ValidationError(
                    "credentials.username cannot be empty".to_string(),
                ));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Parsed server list
    pub fn server_specs(&self) -> Result<Vec<ServerSpec>, ConfigError> {
        self.servers.iter().map(|s| ServerSpec::parse(s)).collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: self.connect_timeout(),
            credentials: self.credentials.clone(),
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            servers: vec![
                "10.0.1.10:11211".to_string(),
                "10.0.1.11:11211".to_string(),
                "10.0.1.12:11211:2".to_string(),
            ],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}
