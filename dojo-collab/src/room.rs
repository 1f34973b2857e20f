//! Room coordinator: one actor task per room.
//!
//! ```text
//!            RoomHandle (mpsc)                         session outboxes
//! conn A ──┐                    ┌──────────────────┐   ┌──► conn A
//! conn B ──┼──► RoomCommand ───►│ Room actor       │───┼──► conn B
//! conn C ──┘                    │  Document        │   └──► conn C
//!                               │  OperationLog    │
//!                               │  SessionTable    │──► CheckpointStore
//!                               └──────────────────┘
//! ```
//!
//! The actor owns the document, the log and the sessions; nothing else can
//! reach them. Commands are handled one at a time in arrival order, so the
//! log order of a room is its arrival order after transformation.
//!
//! Lifecycle: `Empty → Active → Draining → Destroyed`. A room with no
//! sessions drains for `grace_period` and is then destroyed, writing a clean
//! checkpoint when a store is configured.

use std::sync::Arc;
use std::time::Instant;

use dojo_core::{
    rebase, validate, Document, Edit, OperationLog, Operation, OtError, Snapshot,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, OutboxSender};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::presence::{self, PresenceThrottle};
use crate::protocol::{Frame, ServerMessage, SnapshotReason};
use crate::resync::{self, CorrelationIndex, ResyncRequest};
use crate::session::{resolve_participant, Cursor, Session, SessionTable};
use crate::storage::{Checkpoint, CheckpointStore};

/// Lifecycle of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Created, no session has joined yet
    Empty { since: Instant },
    Active,
    /// Last session left; destroyed once the grace period elapses
    Draining { since: Instant },
    Destroyed,
}

/// A join as presented by a connection.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Identity established by the handshake, if any
    pub authenticated: Option<String>,
    /// Identity named in the `join` message
    pub participant_id: Option<String>,
    pub last_revision: Option<u64>,
    pub epoch: Option<Uuid>,
    pub outbox: OutboxSender,
}

/// A registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccepted {
    pub session_id: Uuid,
    pub participant_id: String,
    pub epoch: Uuid,
    pub revision: u64,
}

/// Read-only view of a room for monitoring and tests.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: String,
    pub state: RoomState,
    pub epoch: Uuid,
    pub snapshot: Snapshot,
    pub horizon: u64,
    pub sessions: usize,
    pub broadcast: BroadcastStats,
}

/// Messages processed by the room actor.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<JoinAccepted, CollabError>>,
    },
    Leave {
        session_id: Uuid,
    },
    /// Results go to the session's outbox; `reply` additionally reports
    /// the assigned revision.
    Submit {
        session_id: Uuid,
        edit: Edit,
        base_revision: u64,
        correlation: Option<String>,
        reply: Option<oneshot::Sender<Result<u64, CollabError>>>,
    },
    Cursor {
        session_id: Uuid,
        cursor: Cursor,
    },
    /// Without `reply` the snapshot is queued to the session's outbox.
    Snapshot {
        session_id: Uuid,
        reply: Option<oneshot::Sender<Result<Snapshot, CollabError>>>,
    },
    Resync {
        session_id: Uuid,
        last_revision: u64,
    },
    Ping {
        session_id: Uuid,
    },
    /// Liveness signal without a reply.
    Touch {
        session_id: Uuid,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<Checkpoint, CollabError>>,
    },
    /// Write a clean checkpoint and stop the room.
    Shutdown {
        reply: oneshot::Sender<Result<Checkpoint, CollabError>>,
    },
    Inspect {
        reply: oneshot::Sender<RoomInfo>,
    },
}

/// Cloneable address of a room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Whether the actor has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinAccepted, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join { request, reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn leave(&self, session_id: Uuid) -> Result<(), CollabError> {
        self.send(RoomCommand::Leave { session_id }).await
    }

    /// Queue an edit; the outcome reaches the session through its outbox.
    pub async fn submit(
        &self,
        session_id: Uuid,
        edit: Edit,
        base_revision: u64,
        correlation: Option<String>,
    ) -> Result<(), CollabError> {
        self.send(RoomCommand::Submit {
            session_id,
            edit,
            base_revision,
            correlation,
            reply: None,
        })
        .await
    }

    /// Submit and wait for the assigned revision.
    pub async fn submit_operation(
        &self,
        session_id: Uuid,
        edit: Edit,
        base_revision: u64,
    ) -> Result<u64, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Submit {
            session_id,
            edit,
            base_revision,
            correlation: None,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn update_cursor(&self, session_id: Uuid, cursor: Cursor) -> Result<(), CollabError> {
        self.send(RoomCommand::Cursor { session_id, cursor }).await
    }

    /// Queue a `snapshot` (reason `requested`) to the session.
    pub async fn send_snapshot(&self, session_id: Uuid) -> Result<(), CollabError> {
        self.send(RoomCommand::Snapshot {
            session_id,
            reply: None,
        })
        .await
    }

    /// Current `(text, revision)` as seen by a session.
    pub async fn request_snapshot(&self, session_id: Uuid) -> Result<Snapshot, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Snapshot {
            session_id,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn resync(&self, session_id: Uuid, last_revision: u64) -> Result<(), CollabError> {
        self.send(RoomCommand::Resync {
            session_id,
            last_revision,
        })
        .await
    }

    pub async fn ping(&self, session_id: Uuid) -> Result<(), CollabError> {
        self.send(RoomCommand::Ping { session_id }).await
    }

    pub async fn touch(&self, session_id: Uuid) -> Result<(), CollabError> {
        self.send(RoomCommand::Touch { session_id }).await
    }

    pub async fn checkpoint(&self) -> Result<Checkpoint, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Checkpoint { reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Checkpoint cleanly and stop. The epoch survives the restore.
    pub async fn shutdown(&self) -> Result<Checkpoint, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn inspect(&self) -> Result<RoomInfo, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Inspect { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), CollabError> {
        self.tx.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> CollabError {
        CollabError::RoomClosed(self.room_id.to_string())
    }
}

/// State owned by one room actor.
pub struct Room {
    id: String,
    epoch: Uuid,
    state: RoomState,
    document: Document,
    log: OperationLog,
    sessions: SessionTable,
    group: BroadcastGroup,
    presence: PresenceThrottle,
    correlations: CorrelationIndex,
    config: Arc<ServerConfig>,
    store: Option<Arc<dyn CheckpointStore>>,
    /// Revision of the last checkpoint written by this room
    checkpointed: u64,
}

impl Room {
    /// Empty room at revision 0.
    pub fn new(id: impl Into<String>, config: Arc<ServerConfig>) -> Self {
        Self::from_parts(id.into(), Uuid::new_v4(), Document::new(), config, None)
    }

    /// Room restored from `store` when it holds a checkpoint.
    pub fn open(
        id: impl Into<String>,
        config: Arc<ServerConfig>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<Self, CollabError> {
        let id = id.into();
        let restored = match &store {
            Some(s) => s.load(&id)?,
            None => None,
        };
        let room = match restored {
            Some(cp) => {
                let epoch = cp.restored_epoch();
                log::info!(
                    "Room {id} restored at revision {} (epoch {epoch}{})",
                    cp.revision,
                    if cp.clean { "" } else { ", new" }
                );
                let document = Document::from_snapshot(cp.text, cp.revision);
                Self::from_parts(id, epoch, document, config, store)
            }
            None => {
                log::info!("Room {id} created");
                Self::from_parts(id, Uuid::new_v4(), Document::new(), config, store)
            }
        };
        Ok(room)
    }

    fn from_parts(
        id: String,
        epoch: Uuid,
        document: Document,
        config: Arc<ServerConfig>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        let log = OperationLog::starting_at(config.log_config(), document.revision(), document.len());
        Self {
            id,
            epoch,
            state: RoomState::Empty {
                since: Instant::now(),
            },
            checkpointed: document.revision(),
            document,
            log,
            sessions: SessionTable::new(),
            group: BroadcastGroup::new(),
            presence: PresenceThrottle::new(config.presence_interval),
            correlations: CorrelationIndex::new(),
            config,
            store,
        }
    }

    /// Start the actor.
    pub fn spawn(self) -> (RoomHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.command_capacity.max(1));
        let handle = RoomHandle {
            room_id: Arc::from(self.id.as_str()),
            tx,
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state != RoomState::Destroyed {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => self.destroy(),
                },
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
        }
        rx.close();
        log::debug!("Room {} actor stopped", self.id);
    }

    /// Process one command.
    pub fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { request, reply } => {
                let result = self.join(request);
                let _ = reply.send(result);
            }
            RoomCommand::Leave { session_id } => {
                if self.remove_session(&session_id) {
                    log::info!("Session {session_id} left room {}", self.id);
                }
            }
            RoomCommand::Submit {
                session_id,
                edit,
                base_revision,
                correlation,
                reply,
            } => {
                let result = self.submit(session_id, edit, base_revision, correlation);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RoomCommand::Cursor { session_id, cursor } => self.update_cursor(session_id, cursor),
            RoomCommand::Snapshot { session_id, reply } => {
                let snapshot = if self.sessions.touch(&session_id) {
                    Ok(self.document.snapshot())
                } else {
                    Err(CollabError::NotJoined)
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(snapshot);
                    }
                    None if snapshot.is_ok() => {
                        self.send_snapshot(&session_id, SnapshotReason::Requested)
                    }
                    None => {}
                }
            }
            RoomCommand::Resync {
                session_id,
                last_revision,
            } => self.resync(session_id, last_revision),
            RoomCommand::Ping { session_id } => {
                if self.sessions.touch(&session_id) {
                    self.send_message(&session_id, &ServerMessage::Pong);
                }
            }
            RoomCommand::Touch { session_id } => {
                self.sessions.touch(&session_id);
            }
            RoomCommand::Checkpoint { reply } => {
                let _ = reply.send(self.checkpoint(false));
            }
            RoomCommand::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn join(&mut self, request: JoinRequest) -> Result<JoinAccepted, CollabError> {
        if self.state == RoomState::Destroyed {
            return Err(CollabError::RoomClosed(self.id.clone()));
        }
        let session_id = Uuid::new_v4();
        let participant_id = resolve_participant(
            request.authenticated.as_deref(),
            request.participant_id.as_deref(),
            &session_id,
        )?;

        self.group.add(session_id, request.outbox);
        let plan = resync::plan(
            &self.log,
            ResyncRequest {
                last_revision: request.last_revision,
                epoch: request.epoch,
            },
            self.epoch,
            self.config.max_replay(),
        );
        let frames = resync::render(plan, &self.document, &self.correlations, &participant_id);
        let accepted = JoinAccepted {
            session_id,
            participant_id: participant_id.clone(),
            epoch: self.epoch,
            revision: self.document.revision(),
        };
        let joined = ServerMessage::Joined {
            session_id,
            participant_id: participant_id.clone(),
            room_id: self.id.clone(),
            epoch: self.epoch,
            revision: self.document.revision(),
        };
        for msg in frames.iter().chain(std::iter::once(&joined)) {
            let frame = msg.encode()?;
            if !self.group.send_to(&session_id, frame).is_queued() {
                self.group.remove(&session_id);
                return Err(CollabError::RoomClosed(self.id.clone()));
            }
        }

        self.sessions
            .insert(Session::new(session_id, participant_id.clone(), self.document.revision()));
        if self.state != RoomState::Active {
            log::debug!("Room {} active", self.id);
        }
        self.state = RoomState::Active;
        self.presence.mark_changed();
        self.flush_presence(Instant::now());

        log::info!(
            "{participant_id} joined room {} as session {session_id} at revision {} ({} frames)",
            self.id,
            self.document.revision(),
            frames.len()
        );
        Ok(accepted)
    }

    fn submit(
        &mut self,
        session_id: Uuid,
        edit: Edit,
        base_revision: u64,
        correlation: Option<String>,
    ) -> Result<u64, CollabError> {
        let result = self.sequence(session_id, edit, base_revision, correlation.clone());
        match &result {
            Ok(_) => {}
            Err(CollabError::Ot(e)) if e.is_fatal() => self.corrupt(e),
            Err(CollabError::Ot(e @ OtError::RevisionNotFound { .. })) => {
                log::debug!("Room {}: {e}; sending snapshot to {session_id}", self.id);
                self.send_message(&session_id, &ServerMessage::from_ot_error(e));
                self.send_snapshot(&session_id, SnapshotReason::HistoryTruncated);
            }
            Err(CollabError::Ot(e)) => {
                log::warn!("Room {}: rejected edit from {session_id}: {e}", self.id);
                self.send_message(&session_id, &ServerMessage::from_ot_error(e));
            }
            Err(CollabError::NotJoined) => {}
            Err(e) => {
                log::warn!("Room {}: submit from {session_id} failed: {e}", self.id);
                self.send_message(&session_id, &ServerMessage::error(e.kind(), e.to_string()));
            }
        }
        result
    }

    /// Validate, transform, append, acknowledge.
    fn sequence(
        &mut self,
        session_id: Uuid,
        edit: Edit,
        base_revision: u64,
        correlation: Option<String>,
    ) -> Result<u64, CollabError> {
        let author = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.touch();
                session.participant_id.clone()
            }
            None => return Err(CollabError::NotJoined),
        };
        let resubmitted = correlation
            .as_deref()
            .and_then(|tag| self.correlations.revision_of(tag));
        if let Some(revision) = resubmitted {
            return self.reacknowledge(session_id, revision);
        }
        validate(&edit, self.config.max_op_chars)?;
        let op = rebase(&self.log, &Operation::new(edit, base_revision, author))?;
        let revision = self.log.append(&mut self.document, op)?;
        self.log.verify(&self.document)?;

        self.correlations.record(revision, correlation.clone());
        self.correlations.prune(self.log.horizon());

        let entry = self
            .log
            .entry(revision)
            .cloned()
            .ok_or_else(|| OtError::RoomCorruption(format!("revision {revision} missing after append")))?;
        self.sessions
            .apply_edit(&entry.operation.edit, self.document.len(), revision);
        if self.sessions.len() > 1 && !entry.operation.edit.is_noop() {
            self.presence.mark_changed();
        }

        let plain = ServerMessage::op_ack(&entry, None).encode()?;
        let own = match correlation {
            Some(tag) => ServerMessage::op_ack(&entry, Some(tag)).encode()?,
            None => plain.clone(),
        };
        let mut lagging = Vec::new();
        if !self.group.send_to(&session_id, own).is_queued() {
            lagging.push(session_id);
        }
        lagging.extend(self.group.broadcast(&plain, Some(&session_id)));
        self.drop_lagging(lagging);

        log::debug!(
            "Room {}: r{revision} by {} ({:?})",
            self.id,
            entry.operation.author_id,
            entry.operation.edit
        );
        self.maybe_checkpoint();
        Ok(revision)
    }

    /// Answer a resubmission of an already sequenced edit with its original
    /// ack instead of applying it again.
    fn reacknowledge(&mut self, session_id: Uuid, revision: u64) -> Result<u64, CollabError> {
        log::debug!("Room {}: {session_id} resubmitted r{revision}; acknowledging again", self.id);
        let frame = match self.log.entry(revision) {
            Some(entry) => {
                let tag = self.correlations.get(revision).map(str::to_string);
                ServerMessage::op_ack(entry, tag).encode()?
            }
            None => return Ok(revision),
        };
        if !self.group.send_to(&session_id, frame).is_queued() {
            self.drop_lagging(vec![session_id]);
        }
        Ok(revision)
    }

    fn update_cursor(&mut self, session_id: Uuid, cursor: Cursor) {
        let len = self.document.len();
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.touch();
            session.cursor = cursor.clamped(len);
            log::trace!("Room {}: cursor {session_id} -> {}", self.id, session.cursor.position);
            self.presence.mark_changed();
            self.flush_presence(Instant::now());
        }
    }

    fn resync(&mut self, session_id: Uuid, last_revision: u64) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        session.touch();
        session.last_ack = self.document.revision();
        let participant = session.participant_id.clone();
        let plan = resync::plan(
            &self.log,
            ResyncRequest {
                last_revision: Some(last_revision),
                epoch: None,
            },
            self.epoch,
            self.config.max_replay(),
        );
        let frames = resync::render(plan, &self.document, &self.correlations, &participant);
        log::debug!(
            "Room {}: resync {session_id} from r{last_revision} ({} frames)",
            self.id,
            frames.len()
        );
        for msg in &frames {
            if !self.send_message(&session_id, msg) {
                break;
            }
        }
    }

    /// Periodic housekeeping.
    pub fn on_tick(&mut self, now: Instant) {
        let stale = self.sessions.stale(now, self.config.liveness_timeout);
        if !stale.is_empty() {
            let timeout = CollabError::LivenessTimeout;
            let msg = ServerMessage::error(timeout.kind(), timeout.to_string());
            for id in stale {
                log::info!("Session {id} in room {} timed out", self.id);
                self.send_message(&id, &msg);
                self.remove_session(&id);
            }
        }

        self.flush_presence(now);

        match self.state {
            RoomState::Draining { since } | RoomState::Empty { since }
                if now.saturating_duration_since(since) >= self.config.grace_period =>
            {
                self.destroy();
            }
            _ => {}
        }
    }

    /// Checkpoint the room. `clean` marks the final checkpoint of a room
    /// that accepts no further edits.
    pub fn checkpoint(&mut self, clean: bool) -> Result<Checkpoint, CollabError> {
        let checkpoint = Checkpoint::new(
            self.id.clone(),
            self.document.revision(),
            self.document.text(),
            self.epoch,
            clean,
        );
        if let Some(store) = &self.store {
            store.save(&checkpoint)?;
            self.checkpointed = checkpoint.revision;
            log::info!("Room {} checkpointed at revision {}", self.id, checkpoint.revision);
        }
        Ok(checkpoint)
    }

    fn maybe_checkpoint(&mut self) {
        let every = self.config.checkpoint_every;
        if every == 0 || self.store.is_none() {
            return;
        }
        if self.document.revision().saturating_sub(self.checkpointed) >= every {
            if let Err(e) = self.checkpoint(false) {
                log::error!("Room {}: periodic checkpoint failed: {e}", self.id);
            }
        }
    }

    fn destroy(&mut self) {
        if self.state == RoomState::Destroyed {
            return;
        }
        if self.store.is_some() && self.document.revision() > 0 {
            if let Err(e) = self.checkpoint(true) {
                log::error!("Room {}: final checkpoint failed: {e}", self.id);
            }
        }
        self.sessions.clear();
        self.group.clear();
        self.state = RoomState::Destroyed;
        log::info!("Room {} destroyed at revision {}", self.id, self.document.revision());
    }

    /// Final clean checkpoint on server shutdown. The room accepts nothing
    /// afterwards.
    pub fn shutdown(&mut self) -> Result<Checkpoint, CollabError> {
        let result = self.checkpoint(true);
        if let Err(e) = &result {
            log::error!("Room {}: shutdown checkpoint failed: {e}", self.id);
        }
        self.sessions.clear();
        self.group.clear();
        self.state = RoomState::Destroyed;
        log::info!("Room {} shut down at revision {}", self.id, self.document.revision());
        result
    }

    /// Tear the room down without checkpointing; clients resync from the
    /// last checkpoint when they reconnect.
    pub(crate) fn corrupt(&mut self, err: &OtError) {
        log::error!("Room {} corrupted: {err}", self.id);
        if let Ok(frame) = ServerMessage::from_ot_error(err).encode() {
            self.group.broadcast(&frame, None);
        }
        self.sessions.clear();
        self.group.clear();
        self.state = RoomState::Destroyed;
    }

    fn remove_session(&mut self, session_id: &Uuid) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        self.group.remove(session_id);
        if removed {
            self.presence.mark_changed();
            self.flush_presence(Instant::now());
            if self.sessions.is_empty() && self.state == RoomState::Active {
                log::debug!("Room {} draining", self.id);
                self.state = RoomState::Draining {
                    since: Instant::now(),
                };
            }
        }
        removed
    }

    fn drop_lagging(&mut self, lagging: Vec<Uuid>) {
        for id in lagging {
            log::warn!("Session {id} in room {} is lagging; dropping it", self.id);
            self.remove_session(&id);
        }
    }

    fn flush_presence(&mut self, now: Instant) {
        if !self.presence.take_ready(now) || self.group.is_empty() {
            return;
        }
        match presence::project(&self.sessions).encode() {
            Ok(frame) => {
                let lagging = self.group.broadcast(&frame, None);
                self.drop_lagging(lagging);
            }
            Err(e) => log::error!("Room {}: presence encode failed: {e}", self.id),
        }
    }

    fn send_snapshot(&mut self, session_id: &Uuid, reason: SnapshotReason) {
        let msg = ServerMessage::Snapshot {
            text: self.document.text().to_string(),
            revision: self.document.revision(),
            reason,
        };
        if self.send_message(session_id, &msg) {
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.last_ack = self.document.revision();
            }
        }
    }

    /// Queue one message to one session, dropping it if it cannot keep up.
    fn send_message(&mut self, session_id: &Uuid, msg: &ServerMessage) -> bool {
        let frame: Frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Room {}: encode failed: {e}", self.id);
                return false;
            }
        };
        let queued = self.group.send_to(session_id, frame).is_queued();
        if !queued && self.sessions.get(session_id).is_some() {
            self.drop_lagging(vec![*session_id]);
        }
        queued
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            state: self.state,
            epoch: self.epoch,
            snapshot: self.document.snapshot(),
            horizon: self.log.horizon(),
            sessions: self.sessions.len(),
            broadcast: self.group.stats(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{outbox, OutboxReceiver};
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::for_testing())
    }

    fn join(room: &mut Room, name: &str, last: Option<u64>) -> (JoinAccepted, OutboxReceiver) {
        let (tx, rx) = outbox(64);
        let accepted = room
            .join(JoinRequest {
                authenticated: None,
                participant_id: Some(name.to_string()),
                last_revision: last,
                epoch: None,
                outbox: tx,
            })
            .unwrap();
        (accepted, rx)
    }

    fn drain(rx: &mut OutboxReceiver) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn acks(msgs: &[ServerMessage]) -> Vec<(u64, Option<String>)> {
        msgs.iter()
            .filter_map(|m| match m {
                ServerMessage::OpAck {
                    revision,
                    correlation,
                    ..
                } => Some((*revision, correlation.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_insert() {
        let mut room = Room::new("r", config());
        let (alice, mut rx) = join(&mut room, "alice", None);
        let rev = room
            .submit(alice.session_id, Edit::insert(0, "abc"), 0, Some("c1".into()))
            .unwrap();
        assert_eq!(rev, 1);
        assert_eq!(room.document().text(), "abc");

        let msgs = drain(&mut rx);
        assert!(matches!(
            msgs[0],
            ServerMessage::Snapshot {
                reason: SnapshotReason::Initial,
                revision: 0,
                ..
            }
        ));
        assert!(matches!(msgs[1], ServerMessage::Joined { .. }));
        assert_eq!(acks(&msgs), vec![(1, Some("c1".into()))]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_tie_break() {
        let mut room = Room::new("r", config());
        let (a, mut rx_a) = join(&mut room, "alice", None);
        let (b, mut rx_b) = join(&mut room, "bob", None);
        room.submit(a.session_id, Edit::insert(0, "abc"), 0, None).unwrap();

        room.submit(b.session_id, Edit::insert(1, "Y"), 1, Some("b1".into())).unwrap();
        room.submit(a.session_id, Edit::insert(1, "X"), 1, Some("a1".into())).unwrap();
        assert_eq!(room.document().text(), "aXYbc");
        assert_eq!(room.document().revision(), 3);

        // Originator sees its tag, others do not.
        assert_eq!(acks(&drain(&mut rx_a)), vec![(1, None), (2, None), (3, Some("a1".into()))]);
        assert_eq!(acks(&drain(&mut rx_b)), vec![(1, None), (2, Some("b1".into())), (3, None)]);
    }

    #[tokio::test]
    async fn test_rejections_leave_room_untouched() {
        let mut room = Room::new("r", config());
        let (a, mut rx) = join(&mut room, "alice", None);
        room.submit(a.session_id, Edit::insert(0, "abc"), 0, None).unwrap();
        drain(&mut rx);

        let err = room.submit(a.session_id, Edit::delete(2, 5), 1, None).unwrap_err();
        assert_eq!(err.kind(), "outOfRange");
        let err = room.submit(a.session_id, Edit::insert(0, ""), 1, None).unwrap_err();
        assert_eq!(err.kind(), "rejected");
        let err = room.submit(a.session_id, Edit::insert(0, "x"), 7, None).unwrap_err();
        assert_eq!(err.kind(), "rejected");

        assert_eq!(room.document().text(), "abc");
        assert_eq!(room.document().revision(), 1);
        let kinds: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["outOfRange", "rejected", "rejected"]);
    }

    #[tokio::test]
    async fn test_stale_base_past_horizon_gets_snapshot() {
        let cfg = Arc::new(ServerConfig {
            log_retention: 2,
            ..ServerConfig::for_testing()
        });
        let mut room = Room::new("r", cfg);
        let (a, mut rx) = join(&mut room, "alice", None);
        for i in 0..5 {
            room.submit(a.session_id, Edit::insert(0, "z"), i, None).unwrap();
        }
        drain(&mut rx);

        let err = room.submit(a.session_id, Edit::insert(0, "q"), 1, None).unwrap_err();
        assert_eq!(err.kind(), "revisionNotFound");
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::Snapshot {
                reason: SnapshotReason::HistoryTruncated,
                revision: 5,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_reconnect_replays_with_own_correlations() {
        let mut room = Room::new("r", config());
        let (a, _rx_a) = join(&mut room, "alice", None);
        let (b, _rx_b) = join(&mut room, "bob", None);
        room.submit(a.session_id, Edit::insert(0, "abc"), 0, Some("a1".into())).unwrap();
        room.submit(b.session_id, Edit::insert(3, "d"), 1, Some("b1".into())).unwrap();

        let (_, mut rx) = join(&mut room, "alice", Some(0));
        let msgs = drain(&mut rx);
        assert_eq!(acks(&msgs), vec![(1, Some("a1".into())), (2, None)]);
        assert!(matches!(msgs[2], ServerMessage::Joined { revision: 2, .. }));
    }

    #[tokio::test]
    async fn test_cursor_rebased_through_edits() {
        let mut room = Room::new("r", config());
        let (a, _rx_a) = join(&mut room, "alice", None);
        let (b, _rx_b) = join(&mut room, "bob", None);
        room.submit(a.session_id, Edit::insert(0, "hello"), 0, None).unwrap();
        room.update_cursor(b.session_id, Cursor::new(4, None));
        room.submit(a.session_id, Edit::insert(0, ">> "), 1, None).unwrap();

        let info = room.info();
        assert_eq!(info.sessions, 2);
        let cursor = room.sessions.get(&b.session_id).unwrap().cursor;
        assert_eq!(cursor.position, 7);
    }

    #[tokio::test]
    async fn test_cursor_clamped_on_update() {
        let mut room = Room::new("r", config());
        let (a, _rx) = join(&mut room, "alice", None);
        room.update_cursor(a.session_id, Cursor::new(99, Some(120)));
        let cursor = room.sessions.get(&a.session_id).unwrap().cursor;
        assert_eq!(cursor, Cursor::new(0, Some(0)));
    }

    #[tokio::test]
    async fn test_lagging_session_dropped() {
        let mut room = Room::new("r", config());
        let (a, _rx_a) = join(&mut room, "alice", None);
        let (tx, _slow_rx) = outbox(3);
        let slow = room
            .join(JoinRequest {
                authenticated: None,
                participant_id: Some("slow".into()),
                last_revision: None,
                epoch: None,
                outbox: tx,
            })
            .unwrap();
        for i in 0..4 {
            room.submit(a.session_id, Edit::insert(0, "x"), i, None).unwrap();
        }
        assert!(room.sessions.get(&slow.session_id).is_none());
        assert_eq!(room.info().sessions, 1);
        assert_eq!(room.document().revision(), 4);
    }

    #[tokio::test]
    async fn test_leave_drains_then_destroys_with_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let mut room = Room::open("r", config(), Some(store.clone())).unwrap();
        let (a, _rx) = join(&mut room, "alice", None);
        room.submit(a.session_id, Edit::insert(0, "keep"), 0, None).unwrap();

        room.handle(RoomCommand::Leave {
            session_id: a.session_id,
        });
        assert!(matches!(room.state(), RoomState::Draining { .. }));

        room.on_tick(Instant::now());
        assert!(matches!(room.state(), RoomState::Draining { .. }));
        room.on_tick(Instant::now() + Duration::from_secs(1));
        assert_eq!(room.state(), RoomState::Destroyed);

        let cp = store.load("r").unwrap().unwrap();
        assert_eq!(cp.text, "keep");
        assert_eq!(cp.revision, 1);
        assert!(cp.clean);
        assert_eq!(cp.epoch, room.epoch());
    }

    #[tokio::test]
    async fn test_join_while_draining_reactivates() {
        let mut room = Room::new("r", config());
        let (a, _rx) = join(&mut room, "alice", None);
        room.handle(RoomCommand::Leave {
            session_id: a.session_id,
        });
        let _ = join(&mut room, "bob", None);
        assert_eq!(room.state(), RoomState::Active);
        room.on_tick(Instant::now() + Duration::from_secs(5));
        assert_eq!(room.state(), RoomState::Active);
    }

    #[tokio::test]
    async fn test_restore_continues_revisions() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
        let epoch = Uuid::new_v4();
        store.save(&Checkpoint::new("r", 12, "restored", epoch, true)).unwrap();

        let mut room = Room::open("r", config(), Some(store)).unwrap();
        assert_eq!(room.epoch(), epoch);
        assert_eq!(room.document().revision(), 12);
        let (a, mut rx) = join(&mut room, "alice", Some(4));
        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            ServerMessage::Snapshot {
                reason: SnapshotReason::HistoryTruncated,
                ..
            }
        )));
        let rev = room.submit(a.session_id, Edit::insert(8, "!"), 12, None).unwrap();
        assert_eq!(rev, 13);
        assert_eq!(room.document().text(), "restored!");
    }

    #[tokio::test]
    async fn test_liveness_timeout() {
        let cfg = Arc::new(ServerConfig {
            liveness_timeout: Duration::from_millis(100),
            ..ServerConfig::for_testing()
        });
        let mut room = Room::new("r", cfg);
        let (_a, mut rx) = join(&mut room, "alice", None);
        room.on_tick(Instant::now() + Duration::from_secs(1));
        assert_eq!(room.info().sessions, 0);
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::Error { kind, .. } if kind == "livenessTimeout"
        )));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_periodic_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let cfg = Arc::new(ServerConfig {
            checkpoint_every: 2,
            ..ServerConfig::for_testing()
        });
        let mut room = Room::open("r", cfg, Some(store.clone())).unwrap();
        let (a, _rx) = join(&mut room, "alice", None);
        room.submit(a.session_id, Edit::insert(0, "a"), 0, None).unwrap();
        assert!(store.load("r").unwrap().is_none());
        room.submit(a.session_id, Edit::insert(1, "b"), 1, None).unwrap();
        let cp = store.load("r").unwrap().unwrap();
        assert_eq!(cp.revision, 2);
        assert!(!cp.clean);
    }

    #[tokio::test]
    async fn test_resubmitted_tag_is_applied_once() {
        let mut room = Room::new("r", config());
        let (a, mut rx) = join(&mut room, "alice", None);
        room.submit(a.session_id, Edit::insert(0, "abc"), 0, None).unwrap();

        let first = room
            .submit(a.session_id, Edit::insert(1, "B"), 1, Some("n:2".into()))
            .unwrap();
        let again = room
            .submit(a.session_id, Edit::insert(1, "B"), 1, Some("n:2".into()))
            .unwrap();
        assert_eq!(first, 2);
        assert_eq!(again, 2);
        assert_eq!(room.document().text(), "aBbc");
        assert_eq!(room.document().revision(), 2);
        assert_eq!(
            acks(&drain(&mut rx)),
            vec![(1, None), (2, Some("n:2".into())), (2, Some("n:2".into()))]
        );
    }

    #[tokio::test]
    async fn test_corruption_tears_down_without_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let mut room = Room::open("r", config(), Some(store.clone())).unwrap();
        let (a, mut rx_a) = join(&mut room, "alice", None);
        let (_b, mut rx_b) = join(&mut room, "bob", None);
        room.submit(a.session_id, Edit::insert(0, "safe"), 0, None).unwrap();
        room.checkpoint(false).unwrap();
        room.submit(a.session_id, Edit::insert(4, " lost"), 1, None).unwrap();

        room.corrupt(&OtError::RoomCorruption("log and document diverged".into()));
        assert_eq!(room.state(), RoomState::Destroyed);
        assert_eq!(room.info().sessions, 0);

        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = drain(rx);
            assert!(matches!(
                msgs.last(),
                Some(ServerMessage::Error { kind, .. }) if kind == "roomCorruption"
            ));
            assert!(rx.recv().await.is_none());
        }
        let cp = store.load("r").unwrap().unwrap();
        assert_eq!(cp.revision, 1);
        assert_eq!(cp.text, "safe");
    }

    #[tokio::test]
    async fn test_shutdown_checkpoint_keeps_epoch() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
        let mut room = Room::open("r", config(), Some(store.clone())).unwrap();
        let (a, mut rx) = join(&mut room, "alice", None);
        room.submit(a.session_id, Edit::insert(0, "kept"), 0, None).unwrap();
        drain(&mut rx);

        let cp = room.shutdown().unwrap();
        assert!(cp.clean);
        assert_eq!(room.state(), RoomState::Destroyed);
        assert!(rx.recv().await.is_none());

        let restored = Room::open("r", config(), Some(store)).unwrap();
        assert_eq!(restored.epoch(), room.epoch());
        assert_eq!(restored.document().text(), "kept");
        assert_eq!(restored.document().revision(), 1);
    }

    #[tokio::test]
    async fn test_touch_counts_as_liveness() {
        let cfg = Arc::new(ServerConfig {
            liveness_timeout: Duration::from_millis(100),
            ..ServerConfig::for_testing()
        });
        let mut room = Room::new("r", cfg);
        let (a, mut rx) = join(&mut room, "alice", None);
        drain(&mut rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        room.handle(RoomCommand::Touch {
            session_id: a.session_id,
        });
        room.on_tick(Instant::now());
        assert_eq!(room.info().sessions, 1);
        // No pong is queued for a bare liveness signal.
        assert!(drain(&mut rx).is_empty());

        room.on_tick(Instant::now() + Duration::from_secs(1));
        assert_eq!(room.info().sessions, 0);
    }

    #[tokio::test]
    async fn test_actor_roundtrip() {
        let (handle, task) = Room::new("lobby", config()).spawn();
        let (tx, mut rx) = outbox(16);
        let accepted = handle
            .join(JoinRequest {
                authenticated: Some("alice".into()),
                participant_id: None,
                last_revision: None,
                epoch: None,
                outbox: tx,
            })
            .await
            .unwrap();
        assert_eq!(accepted.participant_id, "alice");

        let rev = handle
            .submit_operation(accepted.session_id, Edit::insert(0, "abc"), 0)
            .await
            .unwrap();
        assert_eq!(rev, 1);
        let snap = handle.request_snapshot(accepted.session_id).await.unwrap();
        assert_eq!(snap, Snapshot { text: "abc".into(), revision: 1 });
        assert!(rx.recv().await.is_some());

        let cp = handle.checkpoint().await.unwrap();
        assert_eq!(cp.revision, 1);

        handle.leave(accepted.session_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(handle.inspect().await, Err(CollabError::RoomClosed(_))));
    }
}
