//! Channel synchronization core for wizlink BLE peripherals.
//!
//! This crate keeps a fixed set of integer channels consistent between
//! the device and one connected central:
//!
//! - **[`ChannelEngine`]**: per-channel value cache. Local writes
//!   overwrite a single slot; a heartbeat task pushes the latest value to
//!   the central once per tick, and remote writes are ingested back into
//!   the cache.
//!
//! - **[`SessionManager`]**: binds engines to one connection under a
//!   fresh `CancellationToken` scope. Activating a new connection tears
//!   the old session down first and joins its tasks.
//!
//! - **[`Snapshot`]**: combine-latest view of every channel, emitted
//!   once all channels have a value and again on each update. Carries a
//!   [`ChannelSetter`] per channel.
//!
//! - **[`PeripheralService`]**: the facade. Capability preflight,
//!   advertiser and server lifecycle, and the observable
//!   [`ServiceState`] via [`StateStream`].
//!
//! The radio stack itself lives behind the `wizlink-gatt` traits.

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod error;
pub mod permission;
pub mod service;
pub mod session;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use aggregator::{ChannelValue, Snapshot};
pub use channel::{ChannelEngine, ChannelSetter};
pub use config::{
    ChannelSpec, DEFAULT_DEVICE_NAME, DEFAULT_HEARTBEAT, DEFAULT_READ_TIMEOUT,
    DEFAULT_SERVICE_UUID, ServiceConfig, default_channels,
};
pub use error::CoreError;
pub use permission::{
    Capability, PermissionChecker, PermissionStatus, REQUIRED_CAPABILITIES, StaticPermissions,
    missing_capabilities,
};
pub use service::{PeripheralService, ServiceState, StartOutcome};
pub use session::SessionManager;
pub use stream::StateStream;
