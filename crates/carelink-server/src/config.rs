//! Server configuration loading from file and environment variables.

use crate::connection::DEFAULT_QUEUE_CAPACITY;
use crate::delivery::{SenderPolicy, DEFAULT_MAX_CONTENT_LEN};
use crate::registry::SessionPolicy;
use carelink_db::PoolSettings;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Token validation settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Realtime connection settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a request waits for a free pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            max_connections: self.pool_max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "carelink_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret access tokens are signed with. Required.
    #[serde(default)]
    pub jwt_secret: String,
}

/// Realtime delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Outbound frames buffered per connection before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Whether a user may hold several connections at once.
    #[serde(default)]
    pub session_policy: SessionPolicy,

    /// Maximum message text length in bytes.
    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,

    /// Who may post into a conversation from the API or a socket.
    #[serde(default)]
    pub sender_policy: SenderPolicy,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "carelink.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_content_len() -> usize {
    DEFAULT_MAX_CONTENT_LEN
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            session_policy: SessionPolicy::default(),
            max_content_len: default_max_content_len(),
            sender_policy: SenderPolicy::default(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CARELINK_HOST` overrides `server.host`
/// - `CARELINK_PORT` overrides `server.port`
/// - `CARELINK_DB_PATH` overrides `database.path`
/// - `CARELINK_LOG_LEVEL` overrides `logging.level`
/// - `CARELINK_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CARELINK_QUEUE_CAPACITY` overrides `realtime.queue_capacity`
/// - `CARELINK_SESSION_POLICY` overrides `realtime.session_policy`
/// - `CARELINK_SENDER_POLICY` overrides `realtime.sender_policy`
/// - `JWT_SECRET` (or `JWT_SECRET_KEY`) overrides `auth.jwt_secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("CARELINK_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("CARELINK_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("CARELINK_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("CARELINK_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("CARELINK_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(capacity) = var("CARELINK_QUEUE_CAPACITY") {
        match capacity.parse::<usize>() {
            Ok(parsed) if parsed > 0 => config.realtime.queue_capacity = parsed,
            _ => tracing::warn!(value = %capacity, "ignoring invalid CARELINK_QUEUE_CAPACITY"),
        }
    }
    if let Some(policy) = var("CARELINK_SESSION_POLICY") {
        match policy.parse() {
            Ok(parsed) => config.realtime.session_policy = parsed,
            Err(e) => tracing::warn!("ignoring CARELINK_SESSION_POLICY: {}", e),
        }
    }
    if let Some(policy) = var("CARELINK_SENDER_POLICY") {
        match policy.parse() {
            Ok(parsed) => config.realtime.sender_policy = parsed,
            Err(e) => tracing::warn!("ignoring CARELINK_SENDER_POLICY: {}", e),
        }
    }
    if let Some(secret) = var("JWT_SECRET").or_else(|| var("JWT_SECRET_KEY")) {
        config.auth.jwt_secret = secret;
    }
}
