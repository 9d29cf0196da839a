// ── Connection session manager ──
//
// Owns the single live session: the channel engines bound to one
// connection plus the cancellation scope their tasks run under.
// Activating a connection always tears the previous session down first,
// and teardown joins every session task before returning.

use std::mem;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wizlink_gatt::{Characteristic, Connection, ConnectionId};

use crate::aggregator::{self, Snapshot};
use crate::channel::ChannelEngine;
use crate::config::{ChannelSpec, ServiceConfig};
use crate::error::CoreError;

/// One active connection's engines and the scope that owns them.
struct Session<C> {
    connection: ConnectionId,
    scope: CancellationToken,
    engines: Vec<ChannelEngine<C>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C> Drop for Session<C> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Creates and destroys sessions; at most one is live at a time.
pub struct SessionManager<C> {
    config: Arc<ServiceConfig>,
    parent: CancellationToken,
    active: Option<Session<C>>,
}

impl<C: Characteristic> SessionManager<C> {
    /// Session scopes are created as children of `parent`.
    pub fn new(config: Arc<ServiceConfig>, parent: CancellationToken) -> Self {
        Self {
            config,
            parent,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_connection(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|s| s.connection)
    }

    /// Engines of the live session, in config order.
    pub fn engines(&self) -> &[ChannelEngine<C>] {
        self.active
            .as_ref()
            .map_or(&[][..], |s| s.engines.as_slice())
    }

    /// Bind a fresh session to `connection`.
    ///
    /// Any previous session is torn down first. Every configured channel
    /// is resolved before anything is spawned, so a failed attempt leaves
    /// no session behind. Returns the session's snapshot stream.
    pub async fn activate(
        &mut self,
        connection: &Connection<C>,
    ) -> Result<mpsc::UnboundedReceiver<Snapshot>, CoreError> {
        self.teardown().await;

        let resolved = self.resolve(connection)?;
        let scope = self.parent.child_token();

        let engines: Vec<ChannelEngine<C>> = resolved
            .into_iter()
            .map(|(spec, characteristic)| {
                ChannelEngine::new(
                    spec,
                    characteristic,
                    self.config.read_timeout,
                    scope.child_token(),
                )
            })
            .collect();

        // The aggregator subscribes before any engine task can store a value.
        let setters = engines.iter().map(ChannelEngine::setter).collect();
        let (snapshots, aggregator) = aggregator::spawn(setters, scope.child_token());

        let mut tasks = vec![aggregator];
        for engine in &engines {
            tasks.extend(engine.start(self.config.heartbeat));
        }
        tasks.push(tokio::spawn(initial_read(engines.clone(), scope.clone())));

        info!(
            connection = %connection.id,
            channels = engines.len(),
            "session active"
        );
        self.active = Some(Session {
            connection: connection.id,
            scope,
            engines,
            tasks,
        });
        Ok(snapshots)
    }

    /// Cancel the live session and wait for all of its tasks.
    ///
    /// Returns the connection the session belonged to, if there was one.
    pub async fn teardown(&mut self) -> Option<ConnectionId> {
        let mut session = self.active.take()?;
        session.scope.cancel();

        for handle in mem::take(&mut session.tasks) {
            if let Err(e) = handle.await {
                warn!(connection = %session.connection, error = %e, "session task failed");
            }
        }
        info!(connection = %session.connection, "session torn down");
        Some(session.connection)
    }

    fn resolve(&self, connection: &Connection<C>) -> Result<Vec<(ChannelSpec, C)>, CoreError> {
        let uuid = self.config.service_uuid;
        let service = connection
            .find_service(uuid)
            .ok_or(CoreError::ServiceNotFound { uuid })?;

        self.config
            .channels
            .iter()
            .map(|spec| {
                service
                    .find_characteristic(spec.uuid)
                    .map(|c| (spec.clone(), c.clone()))
                    .ok_or_else(|| CoreError::MissingChannel {
                        channel: spec.name.clone(),
                        uuid: spec.uuid,
                    })
            })
            .collect()
    }
}

/// Seed every channel from the central, one at a time in config order.
async fn initial_read<C: Characteristic>(
    engines: Vec<ChannelEngine<C>>,
    cancel: CancellationToken,
) {
    for engine in &engines {
        let value = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            value = engine.read() => value,
        };
        debug!(channel = %engine.spec().name, value, "initial read");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wizlink_gatt::{
        IntWidth, LoopbackCharacteristic, LoopbackServer, LoopbackTransport, Server, Transport,
    };

    async fn setup() -> (Arc<ServiceConfig>, LoopbackServer) {
        let config = Arc::new(ServiceConfig::default());
        let server = LoopbackTransport::new()
            .start_server(&config.gatt_service())
            .await
            .unwrap();
        (config, server)
    }

    fn connection(
        server: &LoopbackServer,
        id: ConnectionId,
    ) -> Connection<LoopbackCharacteristic> {
        server.connections().borrow().get(&id).unwrap().clone()
    }

    #[tokio::test]
    async fn activation_builds_one_engine_per_channel() {
        let (config, server) = setup().await;
        let central = server.connect().unwrap();
        let mut sessions = SessionManager::new(Arc::clone(&config), CancellationToken::new());

        sessions.activate(&connection(&server, central.id())).await.unwrap();
        assert_eq!(sessions.active_connection(), Some(central.id()));
        let names: Vec<&str> = sessions.engines().iter().map(|e| e.spec().name.as_str()).collect();
        assert_eq!(names, vec!["data1", "data2", "data3"]);
        sessions.teardown().await;
    }

    #[tokio::test]
    async fn missing_channel_fails_without_partial_activation() {
        let (config, server) = setup().await;
        let first_two: Vec<Uuid> = config.channels.iter().take(2).map(|c| c.uuid).collect();
        let central = server.connect_with(&first_two).unwrap();
        let mut sessions = SessionManager::new(Arc::clone(&config), CancellationToken::new());

        let err = sessions
            .activate(&connection(&server, central.id()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingChannel { ref channel, .. } if channel == "data3"));
        assert!(!sessions.is_active());
    }

    #[tokio::test]
    async fn foreign_service_is_not_found() {
        let (config, server) = setup().await;
        let central = server.connect_foreign(Uuid::new_v4()).unwrap();
        let mut sessions = SessionManager::new(config, CancellationToken::new());

        let err = sessions
            .activate(&connection(&server, central.id()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ServiceNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_read_seeds_snapshot() {
        let (config, server) = setup().await;
        for (value, channel) in [4, 5, 6].into_iter().zip(&config.channels) {
            server.preset_value(channel.uuid, IntWidth::I32.encode(value));
        }
        let central = server.connect().unwrap();
        let mut sessions = SessionManager::new(Arc::clone(&config), CancellationToken::new());

        let mut snapshots = sessions
            .activate(&connection(&server, central.id()))
            .await
            .unwrap();
        assert_eq!(snapshots.recv().await.unwrap().to_vec(), vec![4, 5, 6]);
        sessions.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_stops_all_pushes() {
        let (config, server) = setup().await;
        let central = server.connect().unwrap();
        let mut sessions = SessionManager::new(Arc::clone(&config), CancellationToken::new());
        sessions.activate(&connection(&server, central.id())).await.unwrap();

        for engine in sessions.engines() {
            engine.write(1);
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(central.total_notifies(), 3);

        assert_eq!(sessions.teardown().await, Some(central.id()));
        let after = central.total_notifies();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(central.total_notifies(), after);
    }

    #[tokio::test]
    async fn reactivation_replaces_the_previous_session() {
        let (config, server) = setup().await;
        let first = server.connect().unwrap();
        let second = server.connect().unwrap();
        let mut sessions = SessionManager::new(Arc::clone(&config), CancellationToken::new());

        sessions.activate(&connection(&server, first.id())).await.unwrap();
        let old_setter = sessions.engines()[0].setter();
        sessions.activate(&connection(&server, second.id())).await.unwrap();

        assert_eq!(sessions.active_connection(), Some(second.id()));
        assert!(!old_setter.is_live());
        assert_eq!(sessions.engines()[0].latest(), None);
        sessions.teardown().await;
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_session_tasks() {
        let (config, server) = setup().await;
        let central = server.connect().unwrap();
        let parent = CancellationToken::new();
        let mut sessions = SessionManager::new(Arc::clone(&config), parent.clone());
        sessions.activate(&connection(&server, central.id())).await.unwrap();
        let setter = sessions.engines()[0].setter();

        parent.cancel();
        assert!(!setter.is_live());
        assert!(sessions.teardown().await.is_some());
    }
}
