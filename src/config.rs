//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BREWLINK_LISTEN`, `BREWLINK_ADMIN_KEY`,
//!    `BREWLINK_STORE_URL`
//! 2. **Config file** — path via `--config <path>`, or `brewlink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_connections = 2048
//!
//! [auth]
//! admin_key = "your-secret-key"
//!
//! [store]
//! base_url = "http://127.0.0.1:3001"
//! request_timeout_ms = 5000
//!
//! [relay]
//! device_ping_interval_secs = 10
//! reconcile_interval_secs = 60
//!
//! [proxy]
//! client_ping_interval_secs = 30
//! queue_sweep_interval_secs = 10
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections (default 2048).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Authentication settings for the admin REST surface.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for `/api/*` admin routes. Override with
    /// `BREWLINK_ADMIN_KEY`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_admin_key")]
    pub admin_key: String,
}

/// Account-service (credential store) client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the account service. Override with `BREWLINK_STORE_URL`.
    #[serde(default = "default_store_url")]
    pub base_url: String,
    /// Per-request timeout in milliseconds (default 5000).
    #[serde(default = "default_store_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Device relay cadences.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds between device keep-alive sweeps (default 10).
    #[serde(default = "default_device_ping_interval")]
    pub device_ping_interval_secs: u64,
    /// Seconds between online-flag reconciliation sweeps (default 60).
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

/// Client proxy cadences.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Seconds between client keep-alive sweeps (default 30).
    #[serde(default = "default_client_ping_interval")]
    pub client_ping_interval_secs: u64,
    /// Seconds between pending-queue expiry sweeps (default 10).
    #[serde(default = "default_queue_sweep_interval")]
    pub queue_sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_connections() -> usize {
    2048
}
fn default_admin_key() -> String {
    "change-me".to_string()
}
fn default_store_url() -> String {
    "http://127.0.0.1:3001".to_string()
}
fn default_store_timeout_ms() -> u64 {
    5000
}
fn default_device_ping_interval() -> u64 {
    10
}
fn default_reconcile_interval() -> u64 {
    60
}
fn default_client_ping_interval() -> u64 {
    30
}
fn default_queue_sweep_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_key: default_admin_key(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            request_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            device_ping_interval_secs: default_device_ping_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client_ping_interval_secs: default_client_ping_interval(),
            queue_sweep_interval_secs: default_queue_sweep_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
            relay: RelayConfig::default(),
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `brewlink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("brewlink.toml").exists() {
            let content =
                std::fs::read_to_string("brewlink.toml").expect("Failed to read brewlink.toml");
            toml::from_str(&content).expect("Failed to parse brewlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("BREWLINK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("BREWLINK_ADMIN_KEY") {
            config.auth.admin_key = key;
        }
        if let Ok(url) = std::env::var("BREWLINK_STORE_URL") {
            config.store.base_url = url;
        }

        config
    }
}
