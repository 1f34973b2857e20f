//! Presence projection and broadcast coalescing.
//!
//! Cursor traffic is far more frequent than edits, so a room never sends
//! more than one `presence` message per interval. Changes inside the
//! interval only mark the projection dirty; the room's tick flushes it.
//!
//! ```text
//! cursor / join / leave ──► mark_changed ──► ready? ──yes──► project ──► broadcast
//!                                              │
//!                                              └─no──► flushed on next tick
//! ```

use std::time::{Duration, Instant};

use crate::protocol::{PresenceEntry, ServerMessage};
use crate::session::SessionTable;

/// Rate limiter for a room's presence broadcasts.
#[derive(Debug)]
pub struct PresenceThrottle {
    interval: Duration,
    last_broadcast: Option<Instant>,
    dirty: bool,
}

impl PresenceThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_broadcast: None,
            dirty: false,
        }
    }

    pub fn mark_changed(&mut self) {
        self.dirty = true;
    }

    /// Whether a pending projection may be sent at `now`. Consumes the
    /// pending state when it returns true.
    pub fn take_ready(&mut self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        let due = self
            .last_broadcast
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.dirty = false;
            self.last_broadcast = Some(now);
        }
        due
    }
}

/// Point-in-time list of who is in the room and where their cursors are.
pub fn project(sessions: &SessionTable) -> ServerMessage {
    let entries: Vec<PresenceEntry> = sessions
        .iter()
        .map(|s| PresenceEntry {
            session_id: s.id,
            participant_id: s.participant_id.clone(),
            position: s.cursor.position,
            selection_end: s.cursor.selection_end,
        })
        .collect();
    ServerMessage::Presence {
        count: entries.len(),
        sessions: entries,
    }
}
