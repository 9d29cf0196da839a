use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the transport boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection owning the handle is gone.
    #[error("not connected")]
    NotConnected,

    /// The GATT server has been stopped; no further connections or I/O.
    #[error("GATT server stopped")]
    ServerStopped,

    #[error("characteristic {uuid} not found")]
    CharacteristicNotFound { uuid: Uuid },

    /// The stack refused the operation (e.g. notification queue full).
    #[error("operation rejected by transport: {message}")]
    Rejected { message: String },

    #[error("GATT server failed to start: {message}")]
    ServerStart { message: String },
}

impl Error {
    /// Returns `true` when retrying on a later tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}
