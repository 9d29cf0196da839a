//! Configuration for wizlink.
//!
//! TOML file plus `WIZLINK_*` environment overrides, layered with
//! figment over built-in defaults, and translation to
//! `wizlink_core::ServiceConfig`. The core never reads these types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use wizlink_core::{ChannelSpec, ServiceConfig};
use wizlink_gatt::IntWidth;

/// Prefix of environment overrides, e.g. `WIZLINK_HEARTBEAT_MS=500`.
pub const ENV_PREFIX: &str = "WIZLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Advertised device name.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// UUID of the hosted primary service.
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Bound on the initial read of each channel, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Channels in snapshot order.
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelEntry>,
}

/// One `[[channels]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelEntry {
    pub name: String,
    pub uuid: Uuid,

    /// Byte width on the wire: 1, 2 or 4.
    #[serde(default)]
    pub width: IntWidth,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: default_service_uuid(),
            heartbeat_ms: default_heartbeat_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            channels: default_channels(),
        }
    }
}

fn default_device_name() -> String {
    wizlink_core::DEFAULT_DEVICE_NAME.into()
}
fn default_service_uuid() -> Uuid {
    wizlink_core::DEFAULT_SERVICE_UUID
}
fn default_heartbeat_ms() -> u64 {
    duration_ms(wizlink_core::DEFAULT_HEARTBEAT)
}
fn default_read_timeout_ms() -> u64 {
    duration_ms(wizlink_core::DEFAULT_READ_TIMEOUT)
}
fn default_channels() -> Vec<ChannelEntry> {
    wizlink_core::default_channels()
        .into_iter()
        .map(|c| ChannelEntry {
            name: c.name,
            uuid: c.uuid,
            width: c.width,
        })
        .collect()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Translate into the runtime configuration, validating it on the way.
    pub fn to_service_config(&self) -> Result<ServiceConfig, ConfigError> {
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::Validation {
                field: "heartbeat_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                field: "read_timeout_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let service = ServiceConfig {
            device_name: self.device_name.clone(),
            service_uuid: self.service_uuid,
            channels: self
                .channels
                .iter()
                .map(|c| ChannelSpec::new(c.name.clone(), c.uuid, c.width))
                .collect(),
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        };
        service.validate().map_err(|e| ConfigError::Validation {
            field: "channels".into(),
            reason: e.to_string(),
        })?;
        Ok(service)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "wizlink", "wizlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("wizlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from defaults, file, and environment.
///
/// `path` overrides the platform config path. A missing file is not an
/// error; the defaults and environment still apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed(ENV_PREFIX));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning the defaults if anything fails.
pub fn load_config_or_default(path: Option<&Path>) -> Config {
    load_config(path).unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it, creating parent directories.
///
/// Returns the path written.
pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(&path, toml_str)?;
    Ok(path)
}
