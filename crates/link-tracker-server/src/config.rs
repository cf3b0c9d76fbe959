//! Server configuration loaded from `LINK_TRACKER_*` environment variables.
//!
//! # Environment Variables
//!
//! - `LINK_TRACKER_PUBLIC_ADDR`: public listener address. Default: `127.0.0.1:8080`
//! - `LINK_TRACKER_API_ADDR`: optional second listener for the admin routes
//! - `LINK_TRACKER_DB_PATH`: database file. Default: `link-tracker.db`. `:memory:`
//!   keeps a private in-memory database that does not survive a restart
//! - `LINK_TRACKER_DRAIN_TIMEOUT_SECS`: per-listener drain timeout. Default: `30`
//! - `LINK_TRACKER_READY_TIMEOUT_SECS`: transitional readiness timeout. Default: `10`
//! - `LINK_TRACKER_HIT_QUEUE_CAPACITY`: pending hits before new ones are dropped. Default: `1024`
//! - `LINK_TRACKER_LOG_FORMAT`: `pretty` or `json`. Default: `pretty`
//!
//! An address given as `:8080` listens on all interfaces.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Environment prefix shared by configuration and the restart channel.
pub const ENV_PREFIX: &str = "LINK_TRACKER";

const DEFAULT_PUBLIC_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DB_PATH: &str = "link-tracker.db";
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HIT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a listen address like 127.0.0.1:8080 or :8080, got {value:?}")]
    InvalidAddress { key: String, value: String },

    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("{key} must be at least 1")]
    ZeroCapacity { key: String },

    #[error("{key} must be 'pretty' or 'json', got {value:?}")]
    InvalidLogFormat { key: String, value: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub public_addr: SocketAddr,
    /// When set, the admin routes move to this listener.
    pub api_addr: Option<SocketAddr>,
    /// Every generation opens the same file, so the whitelist survives restarts.
    pub db_path: PathBuf,
    pub drain_timeout: Duration,
    pub ready_timeout: Duration,
    pub hit_queue_capacity: usize,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            api_addr: None,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            hit_queue_capacity: DEFAULT_HIT_QUEUE_CAPACITY,
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Load server configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load server configuration through `lookup`, which maps a variable
    /// name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let key = format!("{ENV_PREFIX}_{suffix}");
            let value = lookup(&key).filter(|v| !v.trim().is_empty());
            (key, value)
        };

        let (key, value) = var("PUBLIC_ADDR");
        let public_addr =
            parse_listen_addr(&key, value.as_deref().unwrap_or(DEFAULT_PUBLIC_ADDR))?;

        let (key, value) = var("API_ADDR");
        let api_addr = value.map(|v| parse_listen_addr(&key, &v)).transpose()?;

        let (_, value) = var("DB_PATH");
        let db_path = PathBuf::from(value.as_deref().unwrap_or(DEFAULT_DB_PATH));

        let (key, value) = var("DRAIN_TIMEOUT_SECS");
        let drain_timeout = Duration::from_secs(parse_number(&key, value, DEFAULT_DRAIN_TIMEOUT_SECS)?);

        let (key, value) = var("READY_TIMEOUT_SECS");
        let ready_timeout = Duration::from_secs(parse_number(&key, value, DEFAULT_READY_TIMEOUT_SECS)?);

        let (key, value) = var("HIT_QUEUE_CAPACITY");
        let hit_queue_capacity = parse_number(&key, value, DEFAULT_HIT_QUEUE_CAPACITY)?;
        if hit_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { key });
        }

        let (key, value) = var("LOG_FORMAT");
        let log_format = match value.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidLogFormat {
                    key,
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            public_addr,
            api_addr,
            db_path,
            drain_timeout,
            ready_timeout,
            hit_queue_capacity,
            log_format,
        })
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Public listener: {}", self.public_addr);
        match self.api_addr {
            Some(addr) => info!("API listener: {}", addr),
            None => info!("API listener: disabled (admin routes on public listener)"),
        }
        if crate::db::is_in_memory(&self.db_path) {
            warn!("Database: in-memory, links and hits are lost on restart");
        } else {
            info!("Database: {}", self.db_path.display());
        }
        info!(
            drain_timeout_secs = self.drain_timeout.as_secs(),
            ready_timeout_secs = self.ready_timeout.as_secs(),
            hit_queue_capacity = self.hit_queue_capacity,
            "Restart and queue limits"
        );
    }
}

/// Parse a listen address, accepting `:port` for all interfaces.
pub fn parse_listen_addr(key: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    let candidate = match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => value.to_string(),
    };
    candidate.parse().map_err(|_| ConfigError::InvalidAddress {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_number<T: std::str::FromStr>(
    key: &str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: v,
        }),
    }
}
