//! Configuration for Mailcast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Broadcast dispatch tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Outbound SMTP relay used by the reference transport
    #[serde(default)]
    pub smtp: SmtpRelayConfig,

    /// Provider webhook settings
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Unsubscribe link settings
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds between scheduler ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Upper bound on recipients pulled per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent transport calls within one batch
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Transport attempts per recipient before it is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Deadline for a single transport call
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,

    /// IANA zone used for recipients without a usable timezone
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Directory holding compiled templates as `<template_id>/<version>.html`
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            batch_size: default_batch_size(),
            worker_concurrency: default_worker_concurrency(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            transport_timeout_secs: default_transport_timeout(),
            default_timezone: default_timezone(),
            template_dir: default_template_dir(),
        }
    }
}

fn default_tick_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_transport_timeout() -> u64 {
    30
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_template_dir() -> String {
    "./templates".to_string()
}

/// Outbound SMTP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpRelayConfig {
    #[serde(default = "default_relay_host")]
    pub host: String,

    #[serde(default = "default_relay_port")]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Implicit TLS
    #[serde(default)]
    pub use_tls: bool,

    #[serde(default = "default_use_starttls")]
    pub use_starttls: bool,
}

impl Default for SmtpRelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            username: None,
            password: None,
            use_tls: false,
            use_starttls: default_use_starttls(),
        }
    }
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_relay_port() -> u16 {
    25
}

fn default_use_starttls() -> bool {
    true
}

/// Provider webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Mailgun HTTP webhook signing key; signatures are checked when set
    pub mailgun_signing_key: Option<String>,

    /// Confirm SES SNS subscriptions automatically
    #[serde(default = "default_sns_auto_confirm")]
    pub sns_auto_confirm: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            mailgun_signing_key: None,
            sns_auto_confirm: default_sns_auto_confirm(),
        }
    }
}

fn default_sns_auto_confirm() -> bool {
    true
}

/// Unsubscribe link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Base URL for unsubscribe links
    #[serde(default = "default_unsubscribe_base_url")]
    pub unsubscribe_base_url: String,

    /// HMAC key for unsubscribe tokens
    #[serde(default = "default_link_secret")]
    pub link_secret: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            unsubscribe_base_url: default_unsubscribe_base_url(),
            link_secret: default_link_secret(),
        }
    }
}

fn default_unsubscribe_base_url() -> String {
    "http://localhost:8080/unsubscribe".to_string()
}

fn default_link_secret() -> String {
    "change-me".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from environment and file
    ///
    /// `MAILCAST_CONFIG` names an explicit file; otherwise the default
    /// locations are tried in order. `DATABASE_URL` overrides `database.url`.
    pub fn load() -> crate::Result<Self> {
        let mut config = match std::env::var("MAILCAST_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let paths = [
                    PathBuf::from("./config.toml"),
                    PathBuf::from("/etc/mailcast/config.toml"),
                ];

                match paths.iter().find(|p| p.exists()) {
                    Some(path) => Self::from_file(path)?,
                    None => {
                        return Err(crate::Error::Config(
                            "No configuration file found".to_string(),
                        ))
                    }
                }
            }
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatch engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.dispatch.batch_size == 0 {
            return Err(crate::Error::Config("dispatch.batch_size must be > 0".into()));
        }
        if self.dispatch.worker_concurrency == 0 {
            return Err(crate::Error::Config(
                "dispatch.worker_concurrency must be > 0".into(),
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(crate::Error::Config("dispatch.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}
