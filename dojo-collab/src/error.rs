//! Service-level errors.

use dojo_core::OtError;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by rooms, the registry and connections.
#[derive(Debug, Clone)]
pub enum CollabError {
    /// Engine error for a single submission or resync
    Ot(OtError),
    /// Session was silent for longer than the liveness timeout
    LivenessTimeout,
    Protocol(ProtocolError),
    Store(StoreError),
    /// The room actor has shut down
    RoomClosed(String),
    /// A room command arrived before `join`
    NotJoined,
    /// Socket setup failed
    Io(String),
}

impl CollabError {
    /// Wire name used in `error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabError::Ot(e) => e.kind(),
            CollabError::LivenessTimeout => "livenessTimeout",
            CollabError::Protocol(_) => "protocol",
            CollabError::Store(_) => "store",
            CollabError::RoomClosed(_) => "roomClosed",
            CollabError::NotJoined => "notJoined",
            CollabError::Io(_) => "io",
        }
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollabError::Ot(e) => write!(f, "{e}"),
            CollabError::LivenessTimeout => write!(f, "no liveness signal within timeout"),
            CollabError::Protocol(e) => write!(f, "{e}"),
            CollabError::Store(e) => write!(f, "{e}"),
            CollabError::RoomClosed(room) => write!(f, "room {room} is closed"),
            CollabError::NotJoined => write!(f, "join a room first"),
            CollabError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<OtError> for CollabError {
    fn from(e: OtError) -> Self {
        CollabError::Ot(e)
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Protocol(e)
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Store(e)
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        CollabError::Io(e.to_string())
    }
}
