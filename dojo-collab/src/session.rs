//! Sessions of a room: identity, cursor, acknowledged revision, liveness.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dojo_core::{transform_position, Edit, OtError};
use uuid::Uuid;

/// Cursor or selection of one session, in code points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub position: usize,
    pub selection_end: Option<usize>,
}

impl Cursor {
    pub fn new(position: usize, selection_end: Option<usize>) -> Self {
        Self {
            position,
            selection_end,
        }
    }

    /// Follow an applied edit, then clamp to the new document length.
    pub fn rebase(&mut self, applied: &Edit, doc_len: usize) {
        self.position = transform_position(self.position, applied).min(doc_len);
        self.selection_end = self
            .selection_end
            .map(|end| transform_position(end, applied).min(doc_len));
    }

    pub fn clamped(self, doc_len: usize) -> Self {
        Self {
            position: self.position.min(doc_len),
            selection_end: self.selection_end.map(|e| e.min(doc_len)),
        }
    }
}

/// One connection's membership in a room.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub participant_id: String,
    pub cursor: Cursor,
    /// Highest revision delivered to this session
    pub last_ack: u64,
    pub last_seen: Instant,
}

impl Session {
    pub fn new(id: Uuid, participant_id: impl Into<String>, revision: u64) -> Self {
        Self {
            id,
            participant_id: participant_id.into(),
            cursor: Cursor::default(),
            last_ack: revision,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Guest identity for sessions that present none.
pub fn guest_name(session_id: &Uuid) -> String {
    let simple = session_id.simple().to_string();
    format!("Guest_{}", &simple[..8])
}

/// Pick the participant id of a new session.
///
/// The handshake identity (set by the auth layer) wins; a `join` naming a
/// different participant is rejected. Blank ids count as absent.
pub fn resolve_participant(
    authenticated: Option<&str>,
    requested: Option<&str>,
    session_id: &Uuid,
) -> Result<String, OtError> {
    let authenticated = authenticated.map(str::trim).filter(|s| !s.is_empty());
    let requested = requested.map(str::trim).filter(|s| !s.is_empty());
    match (authenticated, requested) {
        (Some(auth), Some(req)) if auth != req => Err(OtError::Rejected(format!(
            "join as {req:?} but connection is authenticated as {auth:?}"
        ))),
        (Some(id), _) | (None, Some(id)) => Ok(id.to_string()),
        (None, None) => Ok(guest_name(session_id)),
    }
}

/// Sessions of a room in join order.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<Uuid, Session>,
    order: Vec<Uuid>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        if self.sessions.insert(session.id, session.clone()).is_none() {
            self.order.push(session.id);
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Session> {
        let removed = self.sessions.remove(id)?;
        self.order.retain(|s| s != id);
        Some(removed)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Record a liveness signal. Returns false for unknown sessions.
    pub fn touch(&mut self, id: &Uuid) -> bool {
        match self.sessions.get_mut(id) {
            Some(s) => {
                s.touch();
                true
            }
            None => false,
        }
    }

    /// Move every cursor through an applied edit and mark all sessions as
    /// having seen `revision`.
    pub fn apply_edit(&mut self, applied: &Edit, doc_len: usize, revision: u64) {
        for session in self.sessions.values_mut() {
            session.cursor.rebase(applied, doc_len);
            session.last_ack = revision;
        }
    }

    /// Sessions silent for longer than `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        self.iter()
            .filter(|s| s.is_stale(now, timeout))
            .map(|s| s.id)
            .collect()
    }

    /// Iterate in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
