//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `DOCKHAND_API_KEY`, `DOCKHAND_LISTEN`,
//!    `DOCKHAND_AGENT_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `dockhand.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [proxy]
//! timeout_secs = 60
//! max_body_bytes = 33554432  # 32 MB
//!
//! [heartbeat]
//! interval_secs = 30
//! ack_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//!
//! # One block per remote environment. Omit api_url for edge environments
//! # reached through an agent tunnel.
//! [[environments]]
//! id = "env-1"
//! name = "rack 1"
//! token = "shared-secret"
//!
//! # Optional — only needed by `dockhand agent`
//! [agent]
//! manager_url = "wss://manager.example.com/api/agents/register"
//! environment_id = "env-1"
//! token = "shared-secret"
//! local_api = "http://127.0.0.1:8080"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::environments::Environment;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote environments the proxy can route to.
    #[serde(default)]
    pub environments: Vec<Environment>,
    /// Optional agent configuration for `dockhand agent`.
    pub agent: Option<AgentConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for the admin API. Override with
    /// `DOCKHAND_API_KEY`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Environment proxy limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// End-to-end deadline for one proxied request in seconds (default 60).
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
    /// Maximum buffered request/response body in bytes (default 32 MB).
    /// Larger payloads belong on a sub-stream, not a request frame.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Agent liveness probing.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeat probes to each connected agent (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Seconds to wait for a heartbeat ack (default 10). Two consecutive
    /// missed acks evict the connection.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Outbound tunnel configuration for `dockhand agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Manager registration URL
    /// (e.g. `wss://manager.example.com/api/agents/register`).
    pub manager_url: String,
    /// Environment id this agent serves.
    pub environment_id: String,
    /// Shared secret matching the manager's environment entry. Override with
    /// `DOCKHAND_AGENT_TOKEN`.
    pub token: String,
    /// Base URL of the local API proxied traffic is executed against
    /// (default `http://127.0.0.1:8080`).
    #[serde(default = "default_local_api")]
    pub local_api: String,
    /// Seconds between reconnect attempts (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_proxy_timeout() -> u64 {
    60
}
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024 // 32 MB
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_ack_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_local_api() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxy_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            ack_timeout_secs: default_ack_timeout(),
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

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `dockhand.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("dockhand.toml").exists() {
            let content =
                std::fs::read_to_string("dockhand.toml").expect("Failed to read dockhand.toml");
            toml::from_str(&content).expect("Failed to parse dockhand.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                proxy: ProxyConfig::default(),
                heartbeat: HeartbeatConfig::default(),
                logging: LoggingConfig::default(),
                environments: Vec::new(),
                agent: None,
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("DOCKHAND_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("DOCKHAND_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(token) = std::env::var("DOCKHAND_AGENT_TOKEN") {
            if let Some(agent) = config.agent.as_mut() {
                agent.token = token;
            }
        }

        config
    }
}
