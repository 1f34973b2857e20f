//! Room checkpoints: the persistence hooks of the room coordinator.
//!
//! ```text
//! Room actor ──checkpoint()──► CheckpointStore ──► MemoryStore (tests, no storage path)
//!     ▲                                        └──► RocksStore  (CF "snapshots" LZ4 text,
//!     └──────────restore()──────────────────────                  CF "metadata" bincode)
//! ```
//!
//! A checkpoint is the `(text, revision)` of a room plus the room's epoch.
//! Revisions restart from the checkpoint on restore, so a checkpoint taken
//! while sessions were still editing marks a point where clients may hold
//! revisions the restored room never had; restoring it starts a new epoch.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Persisted state of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub room_id: String,
    pub revision: u64,
    pub text: String,
    /// Incarnation of the room the revision numbers belong to
    pub epoch: Uuid,
    /// Written when the room was destroyed with no later revisions
    pub clean: bool,
    /// Seconds since the Unix epoch
    pub saved_at: u64,
}

impl Checkpoint {
    pub fn new(
        room_id: impl Into<String>,
        revision: u64,
        text: impl Into<String>,
        epoch: Uuid,
        clean: bool,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            revision,
            text: text.into(),
            epoch,
            clean,
            saved_at: now_secs(),
        }
    }

    /// Epoch a room restored from this checkpoint runs under.
    pub fn restored_epoch(&self) -> Uuid {
        if self.clean {
            self.epoch
        } else {
            Uuid::new_v4()
        }
    }
}

/// Storage backend for room checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Replace the checkpoint of `checkpoint.room_id`.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Latest checkpoint of a room, if any.
    fn load(&self, room_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Drop a room's checkpoint. Returns whether one existed.
    fn remove(&self, room_id: &str) -> Result<bool, StoreError>;

    /// Rooms with a checkpoint.
    fn rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Metadata and snapshot of a room disagree
    Inconsistent(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Inconsistent(e) => write!(f, "Inconsistent checkpoint: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_checkpoint_keeps_epoch() {
        let epoch = Uuid::new_v4();
        let cp = Checkpoint::new("r", 3, "abc", epoch, true);
        assert_eq!(cp.restored_epoch(), epoch);
    }

    #[test]
    fn test_periodic_checkpoint_starts_new_epoch() {
        let epoch = Uuid::new_v4();
        let cp = Checkpoint::new("r", 3, "abc", epoch, false);
        assert_ne!(cp.restored_epoch(), epoch);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::CompressionError("bad frame".into());
        assert_eq!(err.to_string(), "Compression error: bad frame");
    }
}
