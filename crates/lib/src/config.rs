//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.duet/config.json`) and environment; CLI flags
//! override both. Every field has a default, so a missing file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listener, static assets, and heartbeat settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 8080). Overridden by DUET_PORT env.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0" so peers on the LAN can reach it).
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory of static assets served on every non-upgrade request (default "public").
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Seconds between heartbeat sweeps (default 30).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

/// Where log lines go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Do not log to the terminal.
    #[serde(default)]
    pub silent: bool,

    /// Append log lines to this file instead of the terminal.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_heartbeat_interval_secs() -> u64 {
    crate::relay::DEFAULT_INTERVAL.as_secs()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            dir: default_dir(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl ServerConfig {
    /// Heartbeat period; never zero.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Parse a port override (e.g. from DUET_PORT). Blank or invalid values are ignored.
fn parse_port_override(value: Option<&str>) -> Option<u16> {
    value.map(str::trim).filter(|s| !s.is_empty()).and_then(|s| match s.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            log::warn!("ignoring invalid DUET_PORT value {:?}", s);
            None
        }
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DUET_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".duet").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, DUET_CONFIG_PATH, or the default path. Missing file =>
/// defaults. Applies the DUET_PORT env override. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    if let Some(port) = parse_port_override(std::env::var("DUET_PORT").ok().as_deref()) {
        config.server.port = port;
    }
    Ok((config, path))
}
