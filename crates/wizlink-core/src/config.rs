// ── Runtime service configuration ──
//
// Describes *what* the peripheral hosts and how it paces traffic.
// Never touches disk: `wizlink-config` (or a test) builds a
// `ServiceConfig` and hands it in.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;
use wizlink_gatt::{AdvertisingConfig, CharacteristicConfig, GattServiceConfig, IntWidth};

use crate::error::CoreError;

/// Interval between heartbeat notifies of a channel's latest value.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Upper bound on the one-shot initial read of a channel.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_DEVICE_NAME: &str = "w";

/// Primary service hosting the wizard channels.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x5732_d41c_e40b_4ec9_8e17_bc61_ba18_5486);

const DEFAULT_CHANNELS: [(&str, Uuid); 3] = [
    ("data1", Uuid::from_u128(0x0609_d529_b3a9_4d18_ac96_e09a_02d1_4cdf)),
    ("data2", Uuid::from_u128(0x315f_b3e2_9c5a_4784_8d30_8ddd_ca5b_9625)),
    ("data3", Uuid::from_u128(0xfd3d_3f21_ab45_4f0d_b0c7_de1d_392d_f061)),
];

/// One synchronized integer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Human-readable key used by snapshots and setters.
    pub name: String,
    /// Characteristic UUID inside the hosted service.
    pub uuid: Uuid,
    /// Wire width; values are clamped into its range.
    pub width: IntWidth,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, uuid: Uuid, width: IntWidth) -> Self {
        Self {
            name: name.into(),
            uuid,
            width,
        }
    }
}

/// Everything the service facade needs to run.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Advertised device name.
    pub device_name: String,
    pub service_uuid: Uuid,
    /// Channels in snapshot order.
    pub channels: Vec<ChannelSpec>,
    pub heartbeat: Duration,
    pub read_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.into(),
            service_uuid: DEFAULT_SERVICE_UUID,
            channels: default_channels(),
            heartbeat: DEFAULT_HEARTBEAT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// The three built-in channels, 4-byte little-endian each.
pub fn default_channels() -> Vec<ChannelSpec> {
    DEFAULT_CHANNELS
        .iter()
        .map(|(name, uuid)| ChannelSpec::new(*name, *uuid, IntWidth::I32))
        .collect()
}

impl ServiceConfig {
    pub fn channel(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// GATT table: one read / write / notify characteristic per channel.
    pub fn gatt_service(&self) -> GattServiceConfig {
        GattServiceConfig {
            uuid: self.service_uuid,
            characteristics: self
                .channels
                .iter()
                .map(|c| CharacteristicConfig::read_write_notify(c.uuid))
                .collect(),
        }
    }

    pub fn advertising(&self) -> AdvertisingConfig {
        AdvertisingConfig::connectable(self.device_name.clone(), self.service_uuid)
    }

    /// Reject configurations the session manager cannot honour.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.channels.is_empty() {
            return Err(CoreError::config("at least one channel is required"));
        }
        if self.heartbeat.is_zero() {
            return Err(CoreError::config("heartbeat interval must be non-zero"));
        }
        if self.read_timeout.is_zero() {
            return Err(CoreError::config("read timeout must be non-zero"));
        }

        let mut names = HashSet::new();
        let mut uuids = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(CoreError::config("channel names must not be empty"));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(CoreError::config(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            if !uuids.insert(channel.uuid) {
                return Err(CoreError::config(format!(
                    "duplicate channel uuid {}",
                    channel.uuid
                )));
            }
            if channel.uuid == self.service_uuid {
                return Err(CoreError::config(format!(
                    "channel '{}' reuses the service uuid",
                    channel.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channels.len(), 3);
        assert_eq!(
            config.service_uuid.to_string(),
            "5732d41c-e40b-4ec9-8e17-bc61ba185486"
        );
    }

    #[test]
    fn gatt_service_lists_every_channel() {
        let config = ServiceConfig::default();
        let service = config.gatt_service();
        let uuids: Vec<Uuid> = service.characteristics.iter().map(|c| c.uuid).collect();
        let expected: Vec<Uuid> = config.channels.iter().map(|c| c.uuid).collect();
        assert_eq!(uuids, expected);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut config = ServiceConfig::default();
        config.channels[1].name = "data1".into();
        assert!(matches!(config.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn duplicate_uuids_are_rejected() {
        let mut config = ServiceConfig::default();
        config.channels[2].uuid = config.channels[0].uuid;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_channel_set_is_rejected() {
        let config = ServiceConfig {
            channels: Vec::new(),
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let config = ServiceConfig {
            heartbeat: Duration::ZERO,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
