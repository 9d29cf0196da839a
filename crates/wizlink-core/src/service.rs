// ── Peripheral service facade ──
//
// Top-level start/stop API. Runs the capability preflight, drives the
// advertiser and GATT server, follows the server's connection map to
// activate and tear down sessions, and publishes the resulting
// `ServiceState` as the only read interface.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wizlink_gatt::{
    AdEvent, Characteristic, Connection, ConnectionId, ConnectionMap, Server, Transport,
};

use crate::aggregator::Snapshot;
use crate::config::ServiceConfig;
use crate::error::CoreError;
use crate::permission::{Capability, PermissionChecker, REQUIRED_CAPABILITIES, missing_capabilities};
use crate::session::SessionManager;
use crate::stream::StateStream;

// ── ServiceState ─────────────────────────────────────────────────────

/// Observable service state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", content = "snapshot", rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    NotStarted,
    WaitingForConnection,
    /// A central is connected and every channel has a value.
    Connected(Snapshot),
}

impl ServiceState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Connected(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// Short label used in logs and CLI output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::WaitingForConnection => "waiting for connection",
            Self::Connected(_) => "connected",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(snapshot) => {
                write!(f, "connected {{")?;
                for (i, value) in snapshot.values().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", value.name, value.value)?;
                }
                write!(f, "}}")
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Result of [`PeripheralService::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Nothing was started; these capabilities must be granted first.
    PermissionRequired(Vec<Capability>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

// ── PeripheralService ────────────────────────────────────────────────

/// The peripheral as seen by the application.
///
/// Cheaply cloneable via `Arc<ServiceInner>`. One instance runs at most
/// once: after [`stop`](Self::stop) it refuses to start again.
pub struct PeripheralService<T: Transport> {
    inner: Arc<ServiceInner<T>>,
}

impl<T: Transport> Clone for PeripheralService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<T: Transport> {
    config: Arc<ServiceConfig>,
    transport: Arc<T>,
    state: watch::Sender<ServiceState>,
    /// Terminal lifetime of this instance; every other token descends from it.
    root: CancellationToken,
    /// Server task and everything it owns (sessions included).
    run: CancellationToken,
    advertising: CancellationToken,
    server: ServerSlot<T::Server>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    advertise_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

type ServerSlot<S> = Arc<Mutex<Option<Arc<S>>>>;

impl<T: Transport> Drop for ServiceInner<T> {
    fn drop(&mut self) {
        // Last handle gone without `stop`; wind the background tasks down.
        self.root.cancel();
    }
}

impl<T: Transport> PeripheralService<T> {
    /// Validate `config` and build an idle service over `transport`.
    pub fn new(config: ServiceConfig, transport: T) -> Result<Self, CoreError> {
        config.validate()?;
        let root = CancellationToken::new();
        let run = root.child_token();
        let advertising = root.child_token();

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config: Arc::new(config),
                transport: Arc::new(transport),
                state: watch::Sender::new(ServiceState::NotStarted),
                root,
                run,
                advertising,
                server: Arc::new(Mutex::new(None)),
                server_task: Mutex::new(None),
                advertise_task: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        self.inner.transport.as_ref()
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> StateStream {
        StateStream::new(self.inner.state.subscribe())
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> ServiceState {
        self.inner.state.borrow().clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Check capabilities, then start advertising and the GATT server.
    ///
    /// Missing capabilities are reported without touching the transport.
    /// The state moves to `WaitingForConnection` once the server is ready.
    pub async fn start<P>(&self, permissions: &P) -> Result<StartOutcome, CoreError>
    where
        P: PermissionChecker + ?Sized,
    {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Stopped => return Err(CoreError::Stopped),
            Lifecycle::Running => {
                debug!("start ignored, service already running");
                return Ok(StartOutcome::Started);
            }
            Lifecycle::Idle => {}
        }

        let missing = missing_capabilities(permissions, &REQUIRED_CAPABILITIES);
        if !missing.is_empty() {
            warn!(?missing, "required capabilities not granted");
            return Ok(StartOutcome::PermissionRequired(missing));
        }

        let events = self
            .inner
            .transport
            .advertise(&self.inner.config.advertising());
        *self.inner.advertise_task.lock().await = Some(tokio::spawn(advertise_task(
            events,
            self.inner.advertising.clone(),
        )));
        *self.inner.server_task.lock().await = Some(tokio::spawn(server_task(
            ServerContext {
                config: Arc::clone(&self.inner.config),
                transport: Arc::clone(&self.inner.transport),
                state: self.inner.state.clone(),
                server: Arc::clone(&self.inner.server),
            },
            self.inner.run.clone(),
        )));

        *lifecycle = Lifecycle::Running;
        info!(
            device_name = %self.inner.config.device_name,
            service = %self.inner.config.service_uuid,
            channels = self.inner.config.channels.len(),
            "peripheral service starting"
        );
        Ok(StartOutcome::Started)
    }

    /// Tear everything down and publish `NotStarted`. Idempotent.
    ///
    /// Order: active session, open connections, server, advertiser,
    /// then the root lifetime.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            debug!("stop ignored, service already stopped");
            return;
        }

        // The server task tears its session down on the way out.
        self.inner.run.cancel();
        if let Some(handle) = self.inner.server_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "server task failed");
            }
        }

        if let Some(server) = self.inner.server.lock().await.take() {
            let open: Vec<ConnectionId> = server.connections().borrow().keys().copied().collect();
            for id in open {
                server.cancel_connection(id);
            }
            server.stop();
        }

        self.inner.advertising.cancel();
        if let Some(handle) = self.inner.advertise_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "advertising task failed");
            }
        }

        self.inner.root.cancel();
        self.inner.state.send_replace(ServiceState::NotStarted);
        *lifecycle = Lifecycle::Stopped;
        info!("peripheral service stopped");
    }
}

impl<T: Transport> fmt::Debug for PeripheralService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralService")
            .field("device_name", &self.inner.config.device_name)
            .field("state", &self.inner.state.borrow().label())
            .finish_non_exhaustive()
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Log advertiser events. Dropping `events` stops advertising.
async fn advertise_task(mut events: BoxStream<'static, AdEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(AdEvent::Failed { reason }) => error!(%reason, "advertising failed"),
                Some(event) => debug!(?event, "advertising event"),
                None => {
                    debug!("advertising stream ended");
                    break;
                }
            },
        }
    }
}

/// What the server task needs from the service.
struct ServerContext<T: Transport> {
    config: Arc<ServiceConfig>,
    transport: Arc<T>,
    state: watch::Sender<ServiceState>,
    server: ServerSlot<T::Server>,
}

/// Start the server, then follow its connection map until cancelled.
async fn server_task<T: Transport>(inner: ServerContext<T>, cancel: CancellationToken) {
    let gatt = inner.config.gatt_service();
    let started = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        result = inner.transport.start_server(&gatt) => result,
    };
    let server = match started {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "GATT server failed to start");
            return;
        }
    };
    *inner.server.lock().await = Some(Arc::clone(&server));

    info!(service = %inner.config.service_uuid, "GATT server ready");
    inner.state.send_replace(ServiceState::WaitingForConnection);

    let mut connections = server.connections();
    let mut tracker = ConnectionTracker::new(
        SessionManager::new(Arc::clone(&inner.config), cancel.clone()),
        inner.config.service_uuid,
        inner.state.clone(),
    );

    let current = connections.borrow_and_update().clone();
    tracker.reconcile(&current).await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = connections.changed() => {
                if changed.is_err() {
                    debug!("connection map closed");
                    break;
                }
                let current = connections.borrow_and_update().clone();
                tracker.reconcile(&current).await;
            }
            Some(snapshot) = tracker.next_snapshot() => {
                inner.state.send_replace(ServiceState::Connected(snapshot));
            }
        }
    }

    tracker.sessions.teardown().await;
}

/// Maps connection-map changes onto session activation and teardown.
///
/// The newest connection exposing the service always wins: its arrival
/// replaces the live session even if the previous central is still
/// listed in the map.
struct ConnectionTracker<C> {
    sessions: SessionManager<C>,
    service_uuid: Uuid,
    state: watch::Sender<ServiceState>,
    snapshots: Option<mpsc::UnboundedReceiver<Snapshot>>,
    /// Connection ids present on the previous reconcile.
    seen: HashSet<ConnectionId>,
    /// Connections that failed activation; not retried while they stay.
    rejected: HashSet<ConnectionId>,
}

impl<C: Characteristic> ConnectionTracker<C> {
    fn new(
        sessions: SessionManager<C>,
        service_uuid: Uuid,
        state: watch::Sender<ServiceState>,
    ) -> Self {
        Self {
            sessions,
            service_uuid,
            state,
            snapshots: None,
            seen: HashSet::new(),
            rejected: HashSet::new(),
        }
    }

    async fn reconcile(&mut self, map: &ConnectionMap<C>) {
        self.rejected.retain(|id| map.contains_key(id));
        let arrived: Vec<ConnectionId> = map
            .keys()
            .filter(|id| !self.seen.contains(id))
            .copied()
            .collect();
        self.seen = map.keys().copied().collect();

        if let Some(active) = self.sessions.active_connection() {
            let newest = arrived
                .iter()
                .rev()
                .filter_map(|id| map.get(id))
                .find(|c| c.find_service(self.service_uuid).is_some());

            match newest {
                None if map.contains_key(&active) => return,
                None => info!(connection = %active, "central disconnected"),
                Some(connection) => info!(
                    previous = %active,
                    connection = %connection.id,
                    "new connection replaces active session"
                ),
            }
            self.snapshots = None;
            self.sessions.teardown().await;
            self.state.send_replace(ServiceState::WaitingForConnection);

            if let Some(connection) = newest {
                if self.try_activate(connection).await {
                    return;
                }
            }
        }

        for connection in map.values().rev() {
            if self.rejected.contains(&connection.id) {
                continue;
            }
            if self.try_activate(connection).await {
                return;
            }
        }
    }

    async fn try_activate(&mut self, connection: &Connection<C>) -> bool {
        match self.sessions.activate(connection).await {
            Ok(snapshots) => {
                self.snapshots = Some(snapshots);
                true
            }
            Err(e @ CoreError::ServiceNotFound { .. }) => {
                debug!(connection = %connection.id, error = %e, "ignoring connection");
                self.rejected.insert(connection.id);
                false
            }
            Err(e) => {
                warn!(connection = %connection.id, error = %e, "connection rejected");
                self.rejected.insert(connection.id);
                false
            }
        }
    }

    async fn next_snapshot(&mut self) -> Option<Snapshot> {
        match self.snapshots.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::permission::StaticPermissions;
    use pretty_assertions::assert_eq;
    use wizlink_gatt::LoopbackTransport;

    fn service() -> (PeripheralService<LoopbackTransport>, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        let service = PeripheralService::new(ServiceConfig::default(), transport.clone()).unwrap();
        (service, transport)
    }

    #[tokio::test]
    async fn missing_capabilities_start_nothing() {
        let (service, transport) = service();
        let denied = StaticPermissions::all_granted().deny(Capability::BluetoothConnect);

        let outcome = service.start(&denied).await.unwrap();
        assert_eq!(
            outcome,
            StartOutcome::PermissionRequired(vec![Capability::BluetoothConnect])
        );
        assert_eq!(transport.server_starts(), 0);
        assert!(!transport.is_advertising());
        assert_eq!(service.current_state(), ServiceState::NotStarted);
    }

    #[tokio::test]
    async fn start_moves_to_waiting_for_connection() {
        let (service, transport) = service();
        let mut state = service.state();

        let outcome = service.start(&StaticPermissions::all_granted()).await.unwrap();
        assert_eq!(outcome, StartOutcome::Started);
        let reached = state
            .wait_for(|s| *s == ServiceState::WaitingForConnection)
            .await;
        assert!(reached.is_some());
        assert_eq!(transport.server_starts(), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let (service, transport) = service();
        let permissions = StaticPermissions::all_granted();
        service.start(&permissions).await.unwrap();
        service.state().wait_for(|s| *s != ServiceState::NotStarted).await;

        assert_eq!(service.start(&permissions).await.unwrap(), StartOutcome::Started);
        assert_eq!(transport.server_starts(), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_is_terminal_and_idempotent() {
        let (service, transport) = service();
        let permissions = StaticPermissions::all_granted();
        service.start(&permissions).await.unwrap();
        let server = transport.wait_for_server().await.unwrap();

        service.stop().await;
        service.stop().await;
        assert_eq!(service.current_state(), ServiceState::NotStarted);
        assert!(server.is_stopped());
        assert!(!transport.is_advertising());
        assert!(matches!(
            service.start(&permissions).await,
            Err(CoreError::Stopped)
        ));
    }

    #[tokio::test]
    async fn server_start_failure_leaves_state_not_started() {
        let (service, transport) = service();
        transport.fail_server_start("adapter unavailable");

        service.start(&StaticPermissions::all_granted()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.current_state(), ServiceState::NotStarted);
        service.stop().await;
    }

    #[tokio::test]
    async fn advertising_failure_does_not_block_the_server() {
        let (service, transport) = service();
        transport.fail_advertising("advertise data too large");
        let mut state = service.state();

        service.start(&StaticPermissions::all_granted()).await.unwrap();
        let reached = state
            .wait_for(|s| *s == ServiceState::WaitingForConnection)
            .await;
        assert!(reached.is_some());
        service.stop().await;
    }

    #[tokio::test]
    async fn foreign_connections_are_ignored() {
        let (service, transport) = service();
        let mut state = service.state();
        service.start(&StaticPermissions::all_granted()).await.unwrap();
        let server = transport.wait_for_server().await.unwrap();

        let _stranger = server.connect_foreign(uuid::Uuid::new_v4()).unwrap();
        let central = server.connect().unwrap();
        for channel in &service.config().channels {
            central
                .write_int(channel.uuid, channel.width, 1)
                .unwrap();
        }

        let connected = state.wait_for(ServiceState::is_connected).await.unwrap();
        assert_eq!(connected.snapshot().unwrap().to_vec(), vec![1, 1, 1]);
        service.stop().await;
    }

    #[test]
    fn state_display_lists_values() {
        assert_eq!(ServiceState::NotStarted.to_string(), "not started");
        assert_eq!(
            ServiceState::WaitingForConnection.to_string(),
            "waiting for connection"
        );
    }
}
