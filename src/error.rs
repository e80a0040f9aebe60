use thiserror::Error;

use crate::domain::MessageError;
use crate::session_log::StorageError;
use crate::transport::TransportError;

/// Errors surfaced by the producer and consumer sessions
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Unsupported meter kind: {0}")]
    UnsupportedMeterKind(String),
    #[error("Session is not connected to a transport")]
    NotConnected,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
