//! Gateway configuration from environment variables.

use crate::error::{GatewayError, Result};
use crate::sync::SyncConfig;
use grid_store::UPDATES_TOPIC;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the gateway binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Deployment environment name (`APP_ENV`).
    pub app_env: String,
    /// HTTP listen address.
    pub server_addr: SocketAddr,
    /// Full Redis connection URL.
    pub redis_url: String,
    /// Port for the Prometheus exporter.
    pub metrics_port: u16,
    /// Highest row index initialized at startup.
    pub grid_rows: u32,
    /// Highest column index initialized at startup.
    pub grid_cols: u32,
    /// Update channel topic.
    pub updates_topic: String,
    /// Keepalive ping interval for viewer connections.
    pub ping_interval: Duration,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let server_addr = parse_listen_addr(&var("SERVER_ADDR", "0.0.0.0:8080"))?;

        let redis_url = match lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            Some(url) => url,
            None => redis_url(
                &var("REDIS_ADDR", "localhost:6379"),
                &var("REDIS_PASSWORD", ""),
                parse_num::<u32>("REDIS_DB", &var("REDIS_DB", "0"))?,
            ),
        };

        let ping_secs: u64 = parse_num("PING_INTERVAL_SECS", &var("PING_INTERVAL_SECS", "30"))?;
        if ping_secs == 0 {
            return Err(GatewayError::Config(
                "PING_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            app_env: var("APP_ENV", "development"),
            server_addr,
            redis_url,
            metrics_port: parse_num("METRICS_PORT", &var("METRICS_PORT", "9090"))?,
            grid_rows: parse_num("GRID_ROWS", &var("GRID_ROWS", "20"))?,
            grid_cols: parse_num("GRID_COLS", &var("GRID_COLS", "20"))?,
            updates_topic: var("UPDATES_TOPIC", UPDATES_TOPIC),
            ping_interval: Duration::from_secs(ping_secs),
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            topic: self.updates_topic.clone(),
            ping_interval: self.ping_interval,
        }
    }
}

/// Accepts `host:port` or a bare `:port`, which binds all interfaces.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let full = match raw.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => raw.to_string(),
    };
    full.parse()
        .map_err(|_| GatewayError::Config(format!("SERVER_ADDR is not a valid address: {}", raw)))
}

fn redis_url(addr: &str, password: &str, db: u32) -> String {
    if password.is_empty() {
        format!("redis://{}/{}", addr, db)
    } else {
        format!("redis://:{}@{}/{}", password, addr, db)
    }
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| GatewayError::Config(format!("{} must be a number, got '{}'", key, raw)))
}
