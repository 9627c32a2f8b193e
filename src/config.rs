//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimiterConfig;

/// Prefix for environment variable overrides, e.g. `TURNSTILE__RATE_LIMITING__RATE=5`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum burst per client, in tokens
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens restored per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// How often the reaper scans for idle clients, in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Idle time after which a client's bucket is dropped, in seconds
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate: default_rate(),
            reap_interval_secs: default_reap_interval(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_capacity() -> f64 {
    10.0
}

fn default_rate() -> f64 {
    2.0
}

fn default_reap_interval() -> u64 {
    60
}

fn default_idle_ttl() -> u64 {
    300
}

impl From<&RateLimitingConfig> for LimiterConfig {
    fn from(cfg: &RateLimitingConfig) -> Self {
        LimiterConfig {
            capacity: cfg.capacity,
            rate: cfg.rate,
            reap_interval: Duration::from_secs(cfg.reap_interval_secs),
            idle_ttl: Duration::from_secs(cfg.idle_ttl_secs),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults, an optional YAML file, and
    /// `TURNSTILE__*` environment variables, in increasing precedence.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would produce a limiter that never refills or
    /// always rejects.
    pub fn validate(&self) -> Result<()> {
        LimiterConfig::from(&self.rate_limiting).validate()
    }
}
