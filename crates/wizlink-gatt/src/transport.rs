// ── Transport boundary ──
//
// The peripheral core never talks to a radio stack directly. It consumes
// these traits: a `Transport` that can advertise and start a GATT
// server, a `Server` that publishes its connection map, and per-connection
// `Characteristic` handles with read / notify / value-change primitives.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Error;

// ── Configuration passed to the stack ────────────────────────────────

/// Characteristic capabilities advertised in the GATT table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Read,
    Write,
    Notify,
}

/// One characteristic in the hosted service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicConfig {
    pub uuid: Uuid,
    pub properties: Vec<Property>,
}

impl CharacteristicConfig {
    /// A read / write / notify characteristic with no initial value.
    pub fn read_write_notify(uuid: Uuid) -> Self {
        Self {
            uuid,
            properties: vec![Property::Read, Property::Write, Property::Notify],
        }
    }
}

/// The primary service hosted by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceConfig {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicConfig>,
}

/// Advertising parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingConfig {
    pub device_name: String,
    /// Service UUID included in the advertising payload.
    pub service_uuid: Uuid,
    pub connectable: bool,
    pub scannable: bool,
    pub include_device_name: bool,
    pub legacy_mode: bool,
}

impl AdvertisingConfig {
    pub fn connectable(device_name: impl Into<String>, service_uuid: Uuid) -> Self {
        Self {
            device_name: device_name.into(),
            service_uuid,
            connectable: true,
            scannable: true,
            include_device_name: true,
            legacy_mode: true,
        }
    }
}

/// Observable advertiser lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdEvent {
    Started,
    Failed { reason: String },
    Stopped,
}

// ── Connection model ─────────────────────────────────────────────────

/// Stack-assigned identifier of a central connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A discovered service on a live connection.
#[derive(Debug, Clone)]
pub struct Service<C> {
    pub uuid: Uuid,
    pub characteristics: Vec<C>,
}

impl<C: Characteristic> Service<C> {
    pub fn find_characteristic(&self, uuid: Uuid) -> Option<&C> {
        self.characteristics.iter().find(|c| c.uuid() == uuid)
    }
}

/// A connected central and the services discovered for it.
#[derive(Debug, Clone)]
pub struct Connection<C> {
    pub id: ConnectionId,
    pub services: Vec<Service<C>>,
}

impl<C> Connection<C> {
    pub fn find_service(&self, uuid: Uuid) -> Option<&Service<C>> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}

/// Snapshot of every live connection, republished on each change.
pub type ConnectionMap<C> = Arc<BTreeMap<ConnectionId, Connection<C>>>;

// ── Traits ───────────────────────────────────────────────────────────

/// Handle to one characteristic on one connection.
///
/// Handles are cheap to clone and become inert (every call fails with
/// [`Error::NotConnected`]) once their connection is gone.
pub trait Characteristic: Clone + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;

    /// Read the characteristic's current value.
    fn read(&self) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Set the value and notify the subscribed central.
    fn notify(&self, value: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Values written by the remote central, in arrival order.
    ///
    /// Local notifications are never echoed on this stream.
    fn value_changes(&self) -> BoxStream<'static, Bytes>;
}

/// A running GATT server.
pub trait Server: Send + Sync + 'static {
    type Characteristic: Characteristic;

    /// Subscribe to the live connection map.
    fn connections(&self) -> watch::Receiver<ConnectionMap<Self::Characteristic>>;

    /// Drop one central connection.
    fn cancel_connection(&self, id: ConnectionId);

    /// Stop serving; all connections are dropped.
    fn stop(&self);
}

/// The radio stack as seen by the peripheral core.
pub trait Transport: Send + Sync + 'static {
    type Server: Server;

    /// Start advertising. Dropping the stream stops advertising.
    fn advertise(&self, config: &AdvertisingConfig) -> BoxStream<'static, AdEvent>;

    /// Open a GATT server hosting `service`. Resolves once the server is ready.
    fn start_server(
        &self,
        service: &GattServiceConfig,
    ) -> impl Future<Output = Result<Self::Server, Error>> + Send;
}
