//! In-memory GATT transport.
//!
//! [`LoopbackTransport`] hosts a GATT server entirely in process. A
//! simulated central ([`LoopbackCentral`]) connects to it, writes raw
//! characteristic values the way a phone or tablet would, observes the
//! notifications the peripheral pushes, and disconnects. Failures can be
//! injected for advertising, server start-up, and individual notifies.
//!
//! Used by the test suites and by the `wizlink simulate` command.
//!
//! ```rust,ignore
//! let transport = LoopbackTransport::new();
//! let server = transport.start_server(&service).await?;
//! let central = server.connect()?;
//! central.write_int(channel_uuid, IntWidth::I32, 42)?;
//! central.disconnect();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::IntWidth;
use crate::error::Error;
use crate::transport::{
    AdEvent, AdvertisingConfig, Characteristic, Connection, ConnectionId, ConnectionMap,
    GattServiceConfig, Server, Service, Transport,
};

const CHANNEL_CAPACITY: usize = 64;

// ── LoopbackTransport ────────────────────────────────────────────────

/// In-process stand-in for a BLE radio stack.
///
/// Cheaply cloneable; clones share the same server slot and failure
/// switches.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    server: watch::Sender<Option<LoopbackServer>>,
    advertising: watch::Sender<bool>,
    server_starts: AtomicUsize,
    advertise_failure: watch::Sender<Option<String>>,
    start_failure: watch::Sender<Option<String>>,
}

impl Default for TransportInner {
    fn default() -> Self {
        Self {
            server: watch::Sender::new(None),
            advertising: watch::Sender::new(false),
            server_starts: AtomicUsize::new(0),
            advertise_failure: watch::Sender::new(None),
            start_failure: watch::Sender::new(None),
        }
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `advertise()` fail with `reason`.
    pub fn fail_advertising(&self, reason: impl Into<String>) {
        self.inner.advertise_failure.send_replace(Some(reason.into()));
    }

    /// Make every subsequent `start_server()` fail with `reason`.
    pub fn fail_server_start(&self, reason: impl Into<String>) {
        self.inner.start_failure.send_replace(Some(reason.into()));
    }

    /// How many times `start_server()` has been called.
    pub fn server_starts(&self) -> usize {
        self.inner.server_starts.load(Ordering::SeqCst)
    }

    pub fn is_advertising(&self) -> bool {
        *self.inner.advertising.borrow()
    }

    /// The most recently started server, if any.
    pub fn server(&self) -> Option<LoopbackServer> {
        self.inner.server.borrow().clone()
    }

    /// Wait until a server has been started.
    pub async fn wait_for_server(&self) -> Result<LoopbackServer, Error> {
        let mut rx = self.inner.server.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ServerStopped)?;
        slot.clone().ok_or(Error::ServerStopped)
    }
}

/// Clears the advertising flag when the advertising stream is dropped.
struct AdvertisingGuard(Arc<TransportInner>);

impl Drop for AdvertisingGuard {
    fn drop(&mut self) {
        self.0.advertising.send_replace(false);
        debug!("loopback advertising stopped");
    }
}

impl Transport for LoopbackTransport {
    type Server = LoopbackServer;

    fn advertise(&self, config: &AdvertisingConfig) -> BoxStream<'static, AdEvent> {
        let inner = Arc::clone(&self.inner);
        let failure = inner.advertise_failure.borrow().clone();
        let device_name = config.device_name.clone();

        Box::pin(async_stream::stream! {
            if let Some(reason) = failure {
                yield AdEvent::Failed { reason };
            } else {
                inner.advertising.send_replace(true);
                let _guard = AdvertisingGuard(Arc::clone(&inner));
                debug!(device_name = %device_name, "loopback advertising started");
                yield AdEvent::Started;
                std::future::pending::<()>().await;
            }
        })
    }

    async fn start_server(&self, service: &GattServiceConfig) -> Result<LoopbackServer, Error> {
        self.inner.server_starts.fetch_add(1, Ordering::SeqCst);

        let failure = self.inner.start_failure.borrow().clone();
        if let Some(message) = failure {
            return Err(Error::ServerStart { message });
        }

        let server = LoopbackServer::new(service.clone());
        self.inner.server.send_replace(Some(server.clone()));
        debug!(service = %service.uuid, "loopback GATT server ready");
        Ok(server)
    }
}

// ── LoopbackServer ───────────────────────────────────────────────────

/// In-memory GATT server. Centrals attach via [`connect`](Self::connect).
#[derive(Clone)]
pub struct LoopbackServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    service: GattServiceConfig,
    connections: watch::Sender<ConnectionMap<LoopbackCharacteristic>>,
    presets: watch::Sender<BTreeMap<Uuid, Bytes>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("service", &self.inner.service.uuid)
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LoopbackServer {
    fn new(service: GattServiceConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                service,
                connections: watch::Sender::new(Arc::new(BTreeMap::new())),
                presets: watch::Sender::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn service(&self) -> &GattServiceConfig {
        &self.inner.service
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    /// Value every characteristic `uuid` starts with on future connections.
    pub fn preset_value(&self, uuid: Uuid, value: impl Into<Bytes>) {
        let value = value.into();
        self.inner.presets.send_modify(|presets| {
            presets.insert(uuid, value);
        });
    }

    /// Connect a central that discovers the full hosted service.
    pub fn connect(&self) -> Result<LoopbackCentral, Error> {
        let all: Vec<Uuid> = self
            .inner
            .service
            .characteristics
            .iter()
            .map(|c| c.uuid)
            .collect();
        self.connect_with(&all)
    }

    /// Connect a central whose discovery only yields `characteristics`.
    pub fn connect_with(&self, characteristics: &[Uuid]) -> Result<LoopbackCentral, Error> {
        self.attach(self.inner.service.uuid, characteristics)
    }

    /// Connect a central exposing an unrelated service.
    pub fn connect_foreign(&self, service_uuid: Uuid) -> Result<LoopbackCentral, Error> {
        self.attach(service_uuid, &[])
    }

    fn attach(&self, service_uuid: Uuid, characteristics: &[Uuid]) -> Result<LoopbackCentral, Error> {
        if self.is_stopped() {
            return Err(Error::ServerStopped);
        }

        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let characteristics: Vec<LoopbackCharacteristic> = {
            let presets = self.inner.presets.borrow();
            characteristics
                .iter()
                .map(|uuid| {
                    let initial = presets.get(uuid).cloned().unwrap_or_default();
                    LoopbackCharacteristic::new(*uuid, initial)
                })
                .collect()
        };

        let connection = Connection {
            id,
            services: vec![Service {
                uuid: service_uuid,
                characteristics: characteristics.clone(),
            }],
        };
        self.inner.connections.send_modify(|map| {
            let mut next = (**map).clone();
            next.insert(id, connection);
            *map = Arc::new(next);
        });
        debug!(connection = %id, "loopback central connected");

        Ok(LoopbackCentral {
            id,
            server: self.clone(),
            characteristics,
        })
    }
}

impl Server for LoopbackServer {
    type Characteristic = LoopbackCharacteristic;

    fn connections(&self) -> watch::Receiver<ConnectionMap<LoopbackCharacteristic>> {
        self.inner.connections.subscribe()
    }

    fn cancel_connection(&self, id: ConnectionId) {
        self.inner.connections.send_if_modified(|map| {
            let mut next = (**map).clone();
            let Some(removed) = next.remove(&id) else {
                return false;
            };
            for service in &removed.services {
                for characteristic in &service.characteristics {
                    characteristic.close();
                }
            }
            *map = Arc::new(next);
            debug!(connection = %id, "loopback connection cancelled");
            true
        });
    }

    fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connections.send_modify(|map| {
            for connection in map.values() {
                for service in &connection.services {
                    for characteristic in &service.characteristics {
                        characteristic.close();
                    }
                }
            }
            *map = Arc::new(BTreeMap::new());
        });
        debug!("loopback GATT server stopped");
    }
}

// ── LoopbackCharacteristic ───────────────────────────────────────────

/// One characteristic on one loopback connection.
#[derive(Clone)]
pub struct LoopbackCharacteristic {
    inner: Arc<CharacteristicState>,
}

struct CharacteristicState {
    uuid: Uuid,
    value: watch::Sender<Bytes>,
    remote_writes: broadcast::Sender<Bytes>,
    notifications: broadcast::Sender<Bytes>,
    notify_count: AtomicUsize,
    fail_notify: AtomicBool,
    closed: CancellationToken,
}

impl fmt::Debug for LoopbackCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackCharacteristic")
            .field("uuid", &self.inner.uuid)
            .field("notify_count", &self.notify_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl LoopbackCharacteristic {
    fn new(uuid: Uuid, initial: Bytes) -> Self {
        let (remote_writes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (notifications, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CharacteristicState {
                uuid,
                value: watch::Sender::new(initial),
                remote_writes,
                notifications,
                notify_count: AtomicUsize::new(0),
                fail_notify: AtomicBool::new(false),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Current attribute value (last notify or remote write).
    pub fn value(&self) -> Bytes {
        self.inner.value.borrow().clone()
    }

    /// Number of successful notifies so far.
    pub fn notify_count(&self) -> usize {
        self.inner.notify_count.load(Ordering::SeqCst)
    }

    /// Observe notifications as the central would receive them.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Bytes> {
        self.inner.notifications.subscribe()
    }

    /// Make notifies fail with [`Error::Rejected`] while `fail` is set.
    pub fn set_fail_notify(&self, fail: bool) {
        self.inner.fail_notify.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn close(&self) {
        self.inner.closed.cancel();
    }

    fn remote_write(&self, value: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.inner.value.send_replace(value.clone());
        // No receivers just means nobody is ingesting writes yet.
        let _ = self.inner.remote_writes.send(value);
        Ok(())
    }
}

impl Characteristic for LoopbackCharacteristic {
    fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    async fn read(&self) -> Result<Bytes, Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        Ok(self.value())
    }

    async fn notify(&self, value: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        if self.inner.fail_notify.load(Ordering::SeqCst) {
            return Err(Error::Rejected {
                message: "notification queue full".into(),
            });
        }
        self.inner.value.send_replace(value.clone());
        self.inner.notify_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.notifications.send(value);
        Ok(())
    }

    fn value_changes(&self) -> BoxStream<'static, Bytes> {
        let uuid = self.inner.uuid;
        let writes = BroadcastStream::new(self.inner.remote_writes.subscribe()).filter_map(
            move |item| match item {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(characteristic = %uuid, error = %e, "remote write stream lagged");
                    None
                }
            },
        );
        let closed = self.inner.closed.clone().cancelled_owned();
        futures_util::StreamExt::boxed(futures_util::StreamExt::take_until(writes, closed))
    }
}

// ── LoopbackCentral ──────────────────────────────────────────────────

/// The remote side of one loopback connection.
#[derive(Debug, Clone)]
pub struct LoopbackCentral {
    id: ConnectionId,
    server: LoopbackServer,
    characteristics: Vec<LoopbackCharacteristic>,
}

impl LoopbackCentral {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&LoopbackCharacteristic> {
        self.characteristics.iter().find(|c| c.inner.uuid == uuid)
    }

    /// Write raw bytes to a characteristic, as a central GATT write.
    pub fn write(&self, uuid: Uuid, value: impl Into<Bytes>) -> Result<(), Error> {
        self.characteristic(uuid)
            .ok_or(Error::CharacteristicNotFound { uuid })?
            .remote_write(value.into())
    }

    /// Write an integer encoded at `width`.
    pub fn write_int(&self, uuid: Uuid, width: IntWidth, value: i32) -> Result<(), Error> {
        self.write(uuid, width.encode(value))
    }

    /// Notifies received on `uuid` (0 for unknown characteristics).
    pub fn notify_count(&self, uuid: Uuid) -> usize {
        self.characteristic(uuid)
            .map_or(0, LoopbackCharacteristic::notify_count)
    }

    /// Notifies received across every characteristic of this connection.
    pub fn total_notifies(&self) -> usize {
        self.characteristics
            .iter()
            .map(LoopbackCharacteristic::notify_count)
            .sum()
    }

    pub fn is_connected(&self) -> bool {
        self.server
            .inner
            .connections
            .borrow()
            .contains_key(&self.id)
    }

    /// Drop the connection from the central side.
    pub fn disconnect(&self) {
        self.server.cancel_connection(self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::CharacteristicConfig;
    use tokio_stream::StreamExt as _;

    fn service(chars: &[Uuid]) -> GattServiceConfig {
        GattServiceConfig {
            uuid: Uuid::new_v4(),
            characteristics: chars
                .iter()
                .copied()
                .map(CharacteristicConfig::read_write_notify)
                .collect(),
        }
    }

    #[test]
    fn wait_for_server_wakes_on_start() {
        let transport = LoopbackTransport::new();
        let mut waiting = tokio_test::task::spawn(transport.wait_for_server());
        tokio_test::assert_pending!(waiting.poll());

        let started = tokio_test::block_on(transport.start_server(&service(&[]))).unwrap();
        assert!(waiting.is_woken());
        let server = tokio_test::assert_ready_ok!(waiting.poll());
        assert_eq!(server.service().uuid, started.service().uuid);
    }

    #[tokio::test]
    async fn connect_publishes_connection_map() {
        let a = Uuid::new_v4();
        let transport = LoopbackTransport::new();
        let server = transport.start_server(&service(&[a])).await.unwrap();
        let rx = server.connections();
        assert!(rx.borrow().is_empty());

        let central = server.connect().unwrap();
        let map = rx.borrow().clone();
        let conn = map.get(&central.id()).unwrap();
        assert!(conn.services[0].find_characteristic(a).is_some());
        assert_eq!(transport.server_starts(), 1);
    }

    #[tokio::test]
    async fn cancel_connection_closes_handles() {
        let a = Uuid::new_v4();
        let transport = LoopbackTransport::new();
        let server = transport.start_server(&service(&[a])).await.unwrap();
        let central = server.connect().unwrap();
        let handle = central.characteristic(a).unwrap().clone();

        central.disconnect();
        assert!(!central.is_connected());
        assert!(matches!(handle.notify(Bytes::from_static(&[1])).await, Err(Error::NotConnected)));
        assert!(matches!(handle.read().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn remote_writes_reach_value_changes_but_notifies_do_not() {
        let a = Uuid::new_v4();
        let transport = LoopbackTransport::new();
        let server = transport.start_server(&service(&[a])).await.unwrap();
        let central = server.connect().unwrap();
        let handle = central.characteristic(a).unwrap().clone();
        let mut changes = handle.value_changes();

        handle.notify(Bytes::from_static(&[9])).await.unwrap();
        central.write(a, Bytes::from_static(&[7])).unwrap();

        assert_eq!(changes.next().await.unwrap().as_ref(), &[7]);
        assert_eq!(handle.read().await.unwrap().as_ref(), &[7]);
        assert_eq!(handle.notify_count(), 1);
    }

    #[tokio::test]
    async fn value_changes_end_when_connection_closes() {
        let a = Uuid::new_v4();
        let transport = LoopbackTransport::new();
        let server = transport.start_server(&service(&[a])).await.unwrap();
        let central = server.connect().unwrap();
        let mut changes = central.characteristic(a).unwrap().value_changes();

        central.disconnect();
        assert!(changes.next().await.is_none());
    }

    #[tokio::test]
    async fn presets_seed_new_connections() {
        let a = Uuid::new_v4();
        let transport = LoopbackTransport::new();
        let server = transport.start_server(&service(&[a])).await.unwrap();
        server.preset_value(a, IntWidth::I32.encode(55));

        let central = server.connect().unwrap();
        let raw = central.characteristic(a).unwrap().read().await.unwrap();
        assert_eq!(IntWidth::I32.decode(&raw).unwrap(), 55);
    }

    #[tokio::test]
    async fn stopped_server_refuses_connections() {
        let transport = LoopbackTransport::new();
        let server = transport.start_server(&service(&[])).await.unwrap();
        server.stop();
        assert!(matches!(server.connect(), Err(Error::ServerStopped)));
    }

    #[tokio::test]
    async fn advertising_flag_follows_stream_lifetime() {
        let transport = LoopbackTransport::new();
        let config = AdvertisingConfig::connectable("w", Uuid::new_v4());
        let mut ads = transport.advertise(&config);

        assert_eq!(ads.next().await, Some(AdEvent::Started));
        assert!(transport.is_advertising());
        drop(ads);
        assert!(!transport.is_advertising());
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let transport = LoopbackTransport::new();
        transport.fail_advertising("radio off");
        transport.fail_server_start("no adapter");

        let mut ads = transport.advertise(&AdvertisingConfig::connectable("w", Uuid::new_v4()));
        assert_eq!(
            ads.next().await,
            Some(AdEvent::Failed {
                reason: "radio off".into()
            })
        );
        assert!(matches!(
            transport.start_server(&service(&[])).await,
            Err(Error::ServerStart { .. })
        ));
    }
}
