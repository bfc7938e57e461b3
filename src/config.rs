//! Configuration management for the FFS server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default chunk size: 2MB
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Default packet retention after last use: 48 hours
pub const DEFAULT_PACKET_TTL_HOURS: u64 = 48;

/// Default header carrying the authenticated username
pub const DEFAULT_IDENTITY_HEADER: &str = "x-remote-user";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request header set by the fronting authenticator
    pub identity_header: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root for assembled files
    pub fs_root: PathBuf,
    /// Root for packet bytes
    pub packet_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Fixed chunk size in bytes; also the largest accepted packet
    pub block_size: usize,
    pub packet_ttl_hours: u64,
    /// Background sweep period in seconds (0 = only sweep after uploads)
    pub sweep_interval_secs: u64,
    /// Optional JSON file replacing the access rules at startup
    pub access_rules_file: Option<PathBuf>,
}

impl TransferConfig {
    pub fn packet_ttl(&self) -> Duration {
        Duration::from_secs(self.packet_ttl_hours.saturating_mul(3600))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            },
            storage: StorageConfig {
                fs_root: PathBuf::from("./data/files"),
                packet_root: PathBuf::from("./data/packets"),
            },
            database: DatabaseConfig {
                url: "sqlite:./ffs.db".to_string(),
            },
            transfer: TransferConfig {
                block_size: DEFAULT_BLOCK_SIZE,
                packet_ttl_hours: DEFAULT_PACKET_TTL_HOURS,
                sweep_interval_secs: 0,
                access_rules_file: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let block_size: usize = parse_var("FFS_NET_BLOCK_SIZE", defaults.transfer.block_size)?;
        if block_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "FFS_NET_BLOCK_SIZE",
                value: "0".to_string(),
                reason: "block size must be positive".to_string(),
            });
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
                identity_header: env::var("FFS_IDENTITY_HEADER")
                    .map(|h| h.to_ascii_lowercase())
                    .unwrap_or(defaults.server.identity_header),
            },
            storage: StorageConfig {
                fs_root: env::var("FFS_FS_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.fs_root),
                packet_root: env::var("FFS_PACKET_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.packet_root),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            transfer: TransferConfig {
                block_size,
                packet_ttl_hours: ttl_hours(parse_var(
                    "FFS_PACKET_TTL_HOURS",
                    defaults.transfer.packet_ttl_hours,
                )?)?,
                sweep_interval_secs: parse_var("FFS_SWEEP_INTERVAL_SECS", 0)?,
                access_rules_file: env::var("FFS_ACCESS_RULES_FILE").ok().map(PathBuf::from),
            },
        })
    }
}

/// Reject retention periods too long to express in seconds
fn ttl_hours(hours: u64) -> Result<u64, ConfigError> {
    match hours.checked_mul(3600) {
        Some(_) => Ok(hours),
        None => Err(ConfigError::InvalidValue {
            name: "FFS_PACKET_TTL_HOURS",
            value: hours.to_string(),
            reason: "retention period overflows".to_string(),
        }),
    }
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
