// ── Core error types ──
//
// Only configuration problems and lifecycle misuse surface as errors.
// Transport and parse failures are absorbed (and logged) inside the
// channel engines; permission gaps are a typed `StartOutcome`, not an
// error.

use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection attempt errors ────────────────────────────────────
    #[error("Service {uuid} not found on connection")]
    ServiceNotFound { uuid: Uuid },

    #[error("Channel '{channel}' ({uuid}) missing from discovered service")]
    MissingChannel { channel: String, uuid: Uuid },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Service has been stopped; create a new instance to start again")]
    Stopped,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Transport errors ─────────────────────────────────────────────
    #[error(transparent)]
    Transport(#[from] wizlink_gatt::Error),
}

impl CoreError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
