//! Configuration management for Turnstile.
//!
//! Values are layered, lowest precedence first: built-in defaults, an
//! optional YAML file, then `TURNSTILE_`-prefixed environment variables
//! using `__` to separate nested keys (`TURNSTILE_LIMITER__LIMIT=10`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Algorithm, MAX_WINDOW};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Deadline for a single decision, store round trip included
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// The per-decision deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1234))
}

fn default_request_timeout_ms() -> u64 {
    250
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Which decision algorithm to run
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Requests per window (fixed window) or bucket capacity (token bucket)
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Token-bucket state expiry after inactivity; twice the window when unset
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,

    /// Prefix for every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            limit: default_limit(),
            window_secs: default_window_secs(),
            idle_ttl_secs: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl LimiterConfig {
    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Idle expiry for token-bucket state.
    pub fn idle_ttl(&self) -> Duration {
        match self.idle_ttl_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.window().saturating_mul(2),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_key_prefix() -> String {
    crate::ratelimit::DEFAULT_KEY_PREFIX.to_string()
}

/// Which [`CounterStore`](crate::store::CounterStore) adapter to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis shared by every instance
    #[default]
    Redis,
    /// In-process map; only correct for a single instance
    Memory,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Adapter selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis `host:port`
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Redis password, if the server requires one
    #[serde(default)]
    pub password: Option<String>,

    /// Redis logical database
    #[serde(default)]
    pub db: i64,

    /// How often the memory backend drops expired keys
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            address: default_store_address(),
            password: None,
            db: 0,
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl StoreConfig {
    /// The memory backend's purge interval as a [`Duration`].
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn default_store_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_purge_interval_secs() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per event
    #[default]
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TurnstileConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiters cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.limit == 0 {
            return Err(TurnstileError::Config(
                "limiter.limit must be a positive number".to_string(),
            ));
        }
        if self.limiter.window_secs == 0 {
            return Err(TurnstileError::Config(
                "limiter.window_secs must be a positive number".to_string(),
            ));
        }
        if self.limiter.window_secs > MAX_WINDOW.as_secs() {
            return Err(TurnstileError::Config(format!(
                "limiter.window_secs must not exceed {}",
                MAX_WINDOW.as_secs()
            )));
        }
        match self.limiter.idle_ttl_secs {
            Some(0) => {
                return Err(TurnstileError::Config(
                    "limiter.idle_ttl_secs must be a positive number".to_string(),
                ))
            }
            Some(secs) if secs > 2 * MAX_WINDOW.as_secs() => {
                return Err(TurnstileError::Config(format!(
                    "limiter.idle_ttl_secs must not exceed {}",
                    2 * MAX_WINDOW.as_secs()
                )))
            }
            _ => {}
        }
        if self.limiter.key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "limiter.key_prefix must not be empty".to_string(),
            ));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "server.request_timeout_ms must be a positive number".to_string(),
            ));
        }
        if self.store.purge_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "store.purge_interval_secs must be a positive number".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.address.trim().is_empty() {
            return Err(TurnstileError::Config(
                "store.address is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
