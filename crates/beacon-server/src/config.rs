//! Server configuration loading from file and environment variables.

use beacon_events::DeliveryConfig;
use beacon_session::ChannelConfig;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Protocol timing settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "beacon_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Protocol timing configuration. Defaults match the wire contract;
/// deployments rarely override these outside of tests.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Handshake completion deadline, seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Grace period after a graceful-shutdown notice, seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Liveness/ping window, seconds.
    #[serde(default = "default_ping_window_secs")]
    pub ping_window_secs: u64,

    /// Liveness sweep cadence, seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Per-delivery redelivery window, seconds.
    #[serde(default = "default_redelivery_window_secs")]
    pub redelivery_window_secs: u64,

    /// Tick-clock period, seconds.
    #[serde(default = "default_tick_period_secs")]
    pub tick_period_secs: u64,

    /// Depth of each channel's outbound frame queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_db_path() -> String {
    "beacon.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    20
}

fn default_ping_window_secs() -> u64 {
    395
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_redelivery_window_secs() -> u64 {
    300
}

fn default_tick_period_secs() -> u64 {
    30
}

fn default_outbound_queue() -> usize {
    256
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
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

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            ping_window_secs: default_ping_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redelivery_window_secs: default_redelivery_window_secs(),
            tick_period_secs: default_tick_period_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl ProtocolConfig {
    /// The channel-level view of these settings.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ping_window: Duration::from_secs(self.ping_window_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            outbound_queue: self.outbound_queue,
        }
    }

    /// The delivery-engine view of these settings.
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            redelivery_window: Duration::from_secs(self.redelivery_window_secs),
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
/// - `BEACON_DB_PATH` overrides `database.path`
/// - `BEACON_LOG_LEVEL` overrides `logging.level`
/// - `BEACON_LOG_JSON` overrides `logging.json` (set to "true" to enable)
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

    // Environment variable overrides
    if let Ok(db_path) = std::env::var("BEACON_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("BEACON_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("BEACON_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

/// Initializes the global tracing subscriber from logging settings.
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
