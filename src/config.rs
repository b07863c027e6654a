//! Configuration loading and types for cloudmux.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! gateway: networking, logging, the initial runtime settings, the billing
//! API, the backend client flavour, and the seed data for the in-memory
//! account registry.

use serde::Deserialize;
use std::path::Path;

use crate::registry::store::{Account, Credential, Settings};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Initial runtime settings (sync intervals, endpoint proxy,
    /// virtual-hosted addressing).  Mutable later through the registry.
    #[serde(default)]
    pub settings: Settings,

    /// Billing API used for operation counters.
    #[serde(default)]
    pub billing: BillingConfig,

    /// Backend client settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Capacity of the credential last-used queue.
    #[serde(default = "default_last_used_queue_capacity")]
    pub last_used_queue_capacity: usize,

    /// Accounts loaded into the in-memory registry at startup.
    #[serde(default)]
    pub accounts: Vec<Account>,

    /// Protocol credentials loaded at startup.
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Region presented to clients.
    #[serde(default = "default_region")]
    pub region: String,

    /// Maximum object (or part) body size in bytes (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,

    /// Largest payload the smart upload router buffers for retries
    /// (default 256 MiB).
    #[serde(default = "default_max_buffered_upload_size")]
    pub max_buffered_upload_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            max_object_size: default_max_object_size(),
            max_buffered_upload_size: default_max_buffered_upload_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
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

/// Billing (GraphQL analytics) API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// GraphQL endpoint.
    #[serde(default = "default_billing_api_url")]
    pub api_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_billing_timeout")]
    pub timeout_seconds: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            api_url: default_billing_api_url(),
            timeout_seconds: default_billing_timeout(),
        }
    }
}

/// Which backend client implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// S3-compatible providers through the AWS SDK.
    #[default]
    Aws,
    /// In-process store; nothing leaves the gateway.
    Memory,
}

/// Backend client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// SigV4 region used when signing backend requests.
    #[serde(default = "default_backend_region")]
    pub region: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            region: default_backend_region(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9020
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_max_buffered_upload_size() -> u64 {
    268_435_456 // 256 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_billing_api_url() -> String {
    "https://api.cloudflare.com/client/v4/graphql".to_string()
}

fn default_billing_timeout() -> u64 {
    30
}

fn default_backend_region() -> String {
    "auto".to_string()
}

fn default_last_used_queue_capacity() -> usize {
    1024
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}
