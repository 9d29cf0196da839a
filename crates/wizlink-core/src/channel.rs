// ── Channel sync engine ──
//
// One engine per channel per session. It owns the channel's single-slot
// value cache, pushes the latest value to the central on a fixed
// heartbeat, ingests writes made by the central, and performs the
// bounded one-shot read used to seed the cache after discovery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use wizlink_gatt::Characteristic;

use crate::config::ChannelSpec;

const CHANGE_CHANNEL_SIZE: usize = 64;

// ── ChannelCell ──────────────────────────────────────────────────────

/// The shared value slot behind an engine and its setters.
pub(crate) struct ChannelCell {
    spec: ChannelSpec,
    latest: watch::Sender<Option<i32>>,
    changes: broadcast::Sender<i32>,
}

impl ChannelCell {
    fn new(spec: ChannelSpec) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            spec,
            latest: watch::Sender::new(None),
            changes,
        }
    }

    pub(crate) fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub(crate) fn current(&self) -> Option<i32> {
        *self.latest.borrow()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<i32> {
        self.changes.subscribe()
    }

    /// Overwrite the cached value and announce it. Returns the stored value.
    fn write(&self, value: i32) -> i32 {
        let width = self.spec.width;
        let stored = width.clamp(value);
        if stored != value {
            warn!(
                channel = %self.spec.name,
                value,
                clamped = stored,
                %width,
                "value out of range for channel width, clamped"
            );
        }
        self.latest.send_replace(Some(stored));
        // Nobody listening yet is fine: the watch slot keeps the value.
        let _ = self.changes.send(stored);
        stored
    }
}

// ── ChannelEngine ────────────────────────────────────────────────────

/// Per-channel synchronization engine bound to one characteristic handle.
#[derive(Clone)]
pub struct ChannelEngine<C> {
    cell: Arc<ChannelCell>,
    characteristic: C,
    read_timeout: Duration,
    scope: CancellationToken,
}

impl<C: Characteristic> ChannelEngine<C> {
    /// Build an idle engine. Nothing runs until [`start`](Self::start).
    pub fn new(
        spec: ChannelSpec,
        characteristic: C,
        read_timeout: Duration,
        scope: CancellationToken,
    ) -> Self {
        Self {
            cell: Arc::new(ChannelCell::new(spec)),
            characteristic,
            read_timeout,
            scope,
        }
    }

    pub fn spec(&self) -> &ChannelSpec {
        self.cell.spec()
    }

    /// The cached value, `None` until the first write or successful read.
    pub fn latest(&self) -> Option<i32> {
        self.cell.current()
    }

    /// Subscribe to every value stored from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<i32> {
        self.cell.subscribe()
    }

    /// A cloneable handle forwarding to [`write`](Self::write).
    pub fn setter(&self) -> ChannelSetter {
        ChannelSetter {
            cell: Arc::clone(&self.cell),
            scope: self.scope.clone(),
        }
    }

    /// Store `value` as the latest value. Never blocks, never queues.
    pub fn write(&self, value: i32) {
        self.cell.write(value);
    }

    /// One bounded transport read.
    ///
    /// A decoded value also becomes the cached value. Transport errors,
    /// timeouts, and undecodable payloads are logged and yield `0`
    /// without touching the cache.
    pub async fn read(&self) -> i32 {
        let spec = self.cell.spec();
        let raw = match tokio::time::timeout(self.read_timeout, self.characteristic.read()).await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(channel = %spec.name, error = %e, "channel read failed");
                return 0;
            }
            Err(_) => {
                warn!(
                    channel = %spec.name,
                    timeout = ?self.read_timeout,
                    "channel read timed out"
                );
                return 0;
            }
        };

        match spec.width.decode(&raw) {
            Ok(value) => self.cell.write(value),
            Err(e) => {
                warn!(channel = %spec.name, error = %e, "unparseable channel value");
                0
            }
        }
    }

    /// Spawn the heartbeat push loop and the remote write ingestion loop.
    ///
    /// Both tasks stop when the engine's scope is cancelled.
    pub fn start(&self, heartbeat: Duration) -> Vec<JoinHandle<()>> {
        // Subscribe before spawning so no remote write slips past.
        let changes = self.characteristic.value_changes();
        debug!(
            channel = %self.cell.spec().name,
            uuid = %self.cell.spec().uuid,
            "channel engine started"
        );

        vec![
            tokio::spawn(push_loop(
                Arc::clone(&self.cell),
                self.characteristic.clone(),
                heartbeat,
                self.scope.clone(),
            )),
            tokio::spawn(ingest_loop(
                Arc::clone(&self.cell),
                changes,
                self.scope.clone(),
            )),
        ]
    }
}

impl<C> fmt::Debug for ChannelEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEngine")
            .field("channel", &self.cell.spec.name)
            .field("latest", &self.cell.current())
            .finish_non_exhaustive()
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Push the latest value once per tick, only once a value exists.
async fn push_loop<C: Characteristic>(
    cell: Arc<ChannelCell>,
    characteristic: C,
    heartbeat: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(heartbeat);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(value) = cell.current() else {
                    continue;
                };
                if cancel.is_cancelled() {
                    break;
                }
                let payload: Bytes = cell.spec.width.encode(value);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = characteristic.notify(payload) => match result {
                        Ok(()) => trace!(channel = %cell.spec.name, value, "heartbeat notify"),
                        Err(e) => warn!(
                            channel = %cell.spec.name,
                            error = %e,
                            transient = e.is_transient(),
                            "notify failed"
                        ),
                    },
                }
            }
        }
    }
    debug!(channel = %cell.spec.name, "push loop stopped");
}

/// Feed writes made by the central into the cache.
async fn ingest_loop(
    cell: Arc<ChannelCell>,
    mut changes: BoxStream<'static, Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = changes.next() => {
                let Some(raw) = next else {
                    debug!(channel = %cell.spec.name, "remote write stream ended");
                    break;
                };
                match cell.spec.width.decode(&raw) {
                    Ok(value) if cell.current() == Some(value) => {
                        trace!(channel = %cell.spec.name, value, "remote write unchanged");
                    }
                    Ok(value) => {
                        debug!(channel = %cell.spec.name, value, "remote write");
                        cell.write(value);
                    }
                    Err(e) => warn!(
                        channel = %cell.spec.name,
                        error = %e,
                        "dropping unparseable remote write"
                    ),
                }
            }
        }
    }
}

// ── ChannelSetter ────────────────────────────────────────────────────

/// Caller-facing write handle for one channel of one session.
///
/// Becomes inert once its session is torn down.
#[derive(Clone)]
pub struct ChannelSetter {
    cell: Arc<ChannelCell>,
    scope: CancellationToken,
}

impl ChannelSetter {
    pub fn name(&self) -> &str {
        &self.cell.spec.name
    }

    pub fn uuid(&self) -> Uuid {
        self.cell.spec.uuid
    }

    /// `true` while the owning session is live.
    pub fn is_live(&self) -> bool {
        !self.scope.is_cancelled()
    }

    /// Write `value` to the channel. Ignored after the session has ended.
    pub fn set(&self, value: i32) {
        if !self.is_live() {
            debug!(channel = %self.cell.spec.name, value, "setter used after session end, ignored");
            return;
        }
        self.cell.write(value);
    }

    pub(crate) fn cell(&self) -> &ChannelCell {
        &self.cell
    }
}

impl fmt::Debug for ChannelSetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSetter")
            .field("channel", &self.cell.spec.name)
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for ChannelSetter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for ChannelSetter {}
