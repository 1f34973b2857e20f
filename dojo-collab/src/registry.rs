//! Room registry: room id → running room actor.
//!
//! Rooms are created lazily on the first join and restored from the
//! checkpoint store when one is configured. A destroyed room's handle stays
//! in the map until the next lookup notices it is closed and replaces it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::room::{JoinAccepted, JoinRequest, Room, RoomHandle};
use crate::storage::CheckpointStore;
use dojo_core::OtError;

/// Attempts made when a room shuts down between lookup and join.
const JOIN_ATTEMPTS: usize = 3;

/// Longest accepted room id, in bytes.
const MAX_ROOM_ID_LEN: usize = 128;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    config: Arc<ServerConfig>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl RoomRegistry {
    pub fn new(config: Arc<ServerConfig>, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            store,
        }
    }

    /// Running room for `room_id`, creating (or restoring) it if needed.
    pub async fn get_or_create(&self, room_id: &str) -> Result<RoomHandle, CollabError> {
        check_room_id(room_id)?;

        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(room_id) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(handle) = rooms.get(room_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let room = Room::open(room_id, self.config.clone(), self.store.clone())?;
        let (handle, _task) = room.spawn();
        rooms.insert(room_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Join `room_id`, retrying when the room closes under the request.
    pub async fn join(
        &self,
        room_id: &str,
        request: JoinRequest,
    ) -> Result<(RoomHandle, JoinAccepted), CollabError> {
        let mut last_err = CollabError::RoomClosed(room_id.to_string());
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.get_or_create(room_id).await?;
            match handle.join(request.clone()).await {
                Ok(accepted) => return Ok((handle, accepted)),
                Err(e @ CollabError::RoomClosed(_)) => {
                    log::debug!("Room {room_id} closed during join (attempt {attempt}), retrying");
                    last_err = e;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Handle of a running room, without creating one.
    pub async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).filter(|h| !h.is_closed()).cloned()
    }

    /// Forget handles of destroyed rooms. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, handle| !handle.is_closed());
        before - rooms.len()
    }

    /// Number of running rooms.
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().filter(|h| !h.is_closed()).count()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<String> = rooms
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop every running room behind a clean checkpoint.
    pub async fn shutdown_all(&self) -> usize {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, handle)| handle).collect()
        };
        let mut saved = 0;
        for handle in handles {
            match handle.shutdown().await {
                Ok(_) => saved += 1,
                Err(CollabError::RoomClosed(_)) => {}
                Err(e) => log::error!("Shutdown of room {} failed: {e}", handle.room_id()),
            }
        }
        saved
    }

    pub fn store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.store.as_ref()
    }
}

fn check_room_id(room_id: &str) -> Result<(), OtError> {
    if room_id.trim().is_empty() {
        return Err(OtError::Rejected("room id must not be empty".into()));
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Err(OtError::Rejected(format!(
            "room id longer than {MAX_ROOM_ID_LEN} bytes"
        )));
    }
    Ok(())
}
