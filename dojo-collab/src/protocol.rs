//! JSON wire protocol spoken over `/ws`.
//!
//! Every frame is a WebSocket text frame holding one object tagged by `type`:
//! ```text
//! client → server   join · op · cursor · leave · ping · snapshot · resync
//! server → client   joined · snapshot · opAck · presence · error · pong
//! ```
//!
//! Outbound messages are encoded once per broadcast and shared between
//! session outboxes as [`Frame`]s.

use std::sync::Arc;

use dojo_core::{Edit, LogEntry, OtError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An encoded outbound message, shared by every recipient.
pub type Frame = Arc<str>;

/// Messages accepted from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Enter a room. `last_revision`/`epoch` are presented on reconnect.
    Join {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_revision: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<Uuid>,
    },
    /// Submit an edit authored against `base_revision`.
    Op {
        base_revision: u64,
        operation: Edit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<String>,
    },
    /// Cursor or selection moved.
    Cursor {
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection_end: Option<usize>,
    },
    Leave,
    Ping,
    /// Ask for a full `(text, revision)` snapshot.
    Snapshot,
    /// Replay everything after `last_revision`, or snapshot if too old.
    Resync { last_revision: u64 },
}

/// Why a snapshot was sent instead of (or before) incremental updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotReason {
    /// First join without a known revision
    Initial,
    /// Explicit `snapshot` request
    Requested,
    /// The presented revision predates the log horizon
    HistoryTruncated,
    /// Replaying would exceed the session's outbound queue
    ReplayTooLarge,
    /// The presented revision belongs to another room incarnation
    EpochChanged,
    /// The presented revision is newer than the room
    AheadOfServer,
}

/// One session in a presence projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub session_id: Uuid,
    pub participant_id: String,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Session registered; follows the resync frames of a join.
    Joined {
        session_id: Uuid,
        participant_id: String,
        room_id: String,
        epoch: Uuid,
        revision: u64,
    },
    Snapshot {
        text: String,
        revision: u64,
        reason: SnapshotReason,
    },
    /// An accepted operation, already transformed to apply at `revision - 1`.
    OpAck {
        revision: u64,
        operation: Edit,
        author_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<String>,
    },
    Presence {
        sessions: Vec<PresenceEntry>,
        count: usize,
    },
    Error {
        kind: String,
        detail: String,
    },
    Pong,
}

impl ServerMessage {
    /// Build an `opAck` for a log entry.
    pub fn op_ack(entry: &LogEntry, correlation: Option<String>) -> Self {
        ServerMessage::OpAck {
            revision: entry.revision,
            operation: entry.operation.edit.clone(),
            author_id: entry.operation.author_id.clone(),
            correlation,
        }
    }

    pub fn error(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    /// Error frame for an engine error.
    pub fn from_ot_error(err: &OtError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    /// Serialize to a shareable text frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Decode a binary frame carrying the same JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A message that is not valid in the connection's current state
    InvalidMessageType(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType(e) => write!(f, "Invalid message: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
