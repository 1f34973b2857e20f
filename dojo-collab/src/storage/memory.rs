//! In-process checkpoint store.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{Checkpoint, CheckpointStore, StoreError};

/// Checkpoints kept in a map; lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Checkpoint>>, StoreError> {
        self.checkpoints
            .lock()
            .map_err(|_| StoreError::DatabaseError("checkpoint map poisoned".into()))
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.lock()?
            .insert(checkpoint.room_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, room_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.lock()?.get(room_id).cloned())
    }

    fn remove(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(room_id).is_some())
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut rooms: Vec<String> = self.lock()?.keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}
