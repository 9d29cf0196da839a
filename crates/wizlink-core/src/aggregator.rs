// ── State aggregator ──
//
// Combine-latest over every channel of a session. A snapshot is emitted
// once all channels hold a value, then again on every single-channel
// update. Each snapshot carries the session's setters so callers can
// write back through the same value they rendered.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::channel::ChannelSetter;

// ── Snapshot ─────────────────────────────────────────────────────────

/// The latest value of one channel inside a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelValue {
    pub name: String,
    pub uuid: Uuid,
    pub value: i32,
}

/// Immutable, fully populated read of every channel, in config order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    values: Arc<[ChannelValue]>,
    #[serde(skip)]
    setters: Arc<[ChannelSetter]>,
}

impl Snapshot {
    pub fn values(&self) -> &[ChannelValue] {
        &self.values
    }

    /// Value of channel `name`.
    pub fn get(&self, name: &str) -> Option<i32> {
        self.values.iter().find(|v| v.name == name).map(|v| v.value)
    }

    /// Setter for channel `name`.
    pub fn setter(&self, name: &str) -> Option<&ChannelSetter> {
        self.setters.iter().find(|s| s.name() == name)
    }

    pub fn setters(&self) -> &[ChannelSetter] {
        &self.setters
    }

    /// Just the integers, in channel order.
    pub fn to_vec(&self) -> Vec<i32> {
        self.values.iter().map(|v| v.value).collect()
    }

    /// Build a snapshot when every slot is populated.
    fn assemble(setters: &Arc<[ChannelSetter]>, latest: &[Option<i32>]) -> Option<Self> {
        let values = setters
            .iter()
            .zip(latest)
            .map(|(setter, value)| {
                value.map(|value| ChannelValue {
                    name: setter.name().to_owned(),
                    uuid: setter.uuid(),
                    value,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            values: values.into(),
            setters: Arc::clone(setters),
        })
    }
}

// ── Aggregation task ─────────────────────────────────────────────────

/// Spawn the combine-latest task for `setters`.
///
/// Subscribes before reading each channel's cache, so values stored
/// before this call are replayed and none after it are missed.
pub(crate) fn spawn(
    setters: Vec<ChannelSetter>,
    cancel: CancellationToken,
) -> (mpsc::UnboundedReceiver<Snapshot>, JoinHandle<()>) {
    let mut streams = StreamMap::new();
    for (index, setter) in setters.iter().enumerate() {
        streams.insert(index, BroadcastStream::new(setter.cell().subscribe()));
    }
    let latest: Vec<Option<i32>> = setters.iter().map(|s| s.cell().current()).collect();
    let setters: Arc<[ChannelSetter]> = setters.into();
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(aggregate(setters, streams, latest, tx, cancel));
    (rx, handle)
}

async fn aggregate(
    setters: Arc<[ChannelSetter]>,
    mut streams: StreamMap<usize, BroadcastStream<i32>>,
    mut latest: Vec<Option<i32>>,
    tx: mpsc::UnboundedSender<Snapshot>,
    cancel: CancellationToken,
) {
    if let Some(snapshot) = Snapshot::assemble(&setters, &latest) {
        if tx.send(snapshot).is_err() {
            debug!("snapshot receiver dropped before seeding");
            return;
        }
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = streams.next() => {
                let Some((index, item)) = next else { break };
                let Some(slot) = latest.get_mut(index) else { continue };
                match item {
                    Ok(value) => *slot = Some(value),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        let Some(setter) = setters.get(index) else { continue };
                        warn!(
                            channel = %setter.name(),
                            skipped,
                            "aggregator lagged, resyncing from cache"
                        );
                        *slot = setter.cell().current();
                    }
                }

                if let Some(snapshot) = Snapshot::assemble(&setters, &latest) {
                    trace!(values = ?snapshot.to_vec(), "snapshot");
                    if tx.send(snapshot).is_err() {
                        debug!("snapshot receiver dropped");
                        break;
                    }
                }
            }
        }
    }
}
