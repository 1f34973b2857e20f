//! WebSocket sync client.
//!
//! Provides:
//! - [`ClientDocument`], the client half of the sync protocol: at most one
//!   edit in flight, later edits buffered, remote edits rebased over both
//! - [`SyncClient`], a connection wrapper that drives a `ClientDocument`
//!   from the socket and reports [`SyncEvent`]s
//!
//! Nothing is submitted between `join` and `joined`: the replay that
//! precedes `joined` may acknowledge the edit that was in flight when the
//! connection dropped. Local edits made meanwhile stay pending and the
//! first of them goes out with `joined`.

use std::collections::VecDeque;
use std::sync::Arc;

use dojo_core::{transform_pair, Document, Edit, Operation, OtError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{ClientMessage, PresenceEntry, ProtocolError, ServerMessage, SnapshotReason};
use crate::server::PARTICIPANT_HEADER;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, `joined` not yet received
    Connected,
    Joined,
}

/// An edit sent to the server and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
struct InFlight {
    edit: Edit,
    correlation: String,
}

/// Result of applying one server message to a [`ClientDocument`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutcome {
    /// Our in-flight edit was sequenced at `revision`.
    Acked {
        revision: u64,
        /// Next buffered edit, ready to send
        next: Option<ClientMessage>,
    },
    /// Another session's edit, applied locally as `edit`.
    Remote {
        revision: u64,
        author_id: String,
        edit: Edit,
    },
    /// A replayed revision we already have.
    Duplicate { revision: u64 },
    /// Revisions were skipped; the message asks the server to fill the gap.
    Gap { expected: u64, resync: ClientMessage },
    Snapshot {
        revision: u64,
        reason: SnapshotReason,
        /// Pending local edits dropped with the old text
        discarded: usize,
    },
    Joined {
        session_id: Uuid,
        revision: u64,
        /// First submission of this connection: the edit still in flight
        /// from before a reconnect, else the oldest buffered edit
        resubmit: Option<ClientMessage>,
    },
    Presence(Vec<PresenceEntry>),
    Error {
        kind: String,
        detail: String,
        /// Snapshot request sent after a rejected edit
        recover: Option<ClientMessage>,
    },
    Pong,
}

/// Local replica of a room's document.
#[derive(Debug)]
pub struct ClientDocument {
    participant_id: Option<String>,
    document: Document,
    /// Last revision received from the server
    server_revision: u64,
    in_flight: Option<InFlight>,
    buffer: VecDeque<Edit>,
    nonce: String,
    seq: u64,
    session_id: Option<Uuid>,
    epoch: Option<Uuid>,
    /// Whether the server has ever sent us state
    synced: bool,
    /// `joined` received on the current connection
    live: bool,
}

impl ClientDocument {
    pub fn new(participant_id: Option<String>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            participant_id,
            document: Document::new(),
            server_revision: 0,
            in_flight: None,
            buffer: VecDeque::new(),
            nonce: nonce[..8].to_string(),
            seq: 0,
            session_id: None,
            epoch: None,
            synced: false,
            live: false,
        }
    }

    /// The `join` to send on (re)connect. Presents the last known revision
    /// and epoch once the document has been synced. Submissions are held
    /// until the matching `joined`.
    pub fn join_message(&mut self, room_id: &str) -> ClientMessage {
        self.live = false;
        ClientMessage::Join {
            room_id: room_id.to_string(),
            participant_id: self.participant_id.clone(),
            last_revision: self.synced.then_some(self.server_revision),
            epoch: self.epoch,
        }
    }

    /// Apply a local edit. Returns the `op` to send when joined with nothing
    /// else in flight; otherwise the edit waits in the buffer.
    pub fn local_edit(&mut self, edit: Edit) -> Result<Option<ClientMessage>, OtError> {
        if edit.is_noop() {
            return Ok(None);
        }
        self.document.apply(&edit)?;
        if self.in_flight.is_some() || !self.live {
            self.buffer.push_back(edit);
            return Ok(None);
        }
        Ok(Some(self.send(edit)))
    }

    /// The connection carrying this document is gone.
    pub fn connection_lost(&mut self) {
        self.live = false;
    }

    /// Message for the in-flight edit, if any.
    pub fn resubmit(&self) -> Option<ClientMessage> {
        self.in_flight.as_ref().map(|f| ClientMessage::Op {
            base_revision: self.server_revision,
            operation: f.edit.clone(),
            correlation: Some(f.correlation.clone()),
        })
    }

    pub fn apply_server(&mut self, msg: ServerMessage) -> ClientOutcome {
        match msg {
            ServerMessage::OpAck {
                revision,
                operation,
                author_id,
                correlation,
            } => self.apply_ack(revision, operation, author_id, correlation),
            ServerMessage::Snapshot {
                text,
                revision,
                reason,
            } => {
                // Pending edits were authored against text this snapshot
                // replaces, whatever its reason.
                let discarded = self.pending();
                if discarded > 0 {
                    log::warn!(
                        "Snapshot at r{revision} ({reason:?}) discards {discarded} pending edits"
                    );
                }
                self.in_flight = None;
                self.buffer.clear();
                self.document = Document::from_snapshot(text, revision);
                self.server_revision = revision;
                self.synced = true;
                ClientOutcome::Snapshot {
                    revision,
                    reason,
                    discarded,
                }
            }
            ServerMessage::Joined {
                session_id,
                participant_id,
                epoch,
                revision,
                ..
            } => {
                self.session_id = Some(session_id);
                self.participant_id = Some(participant_id);
                self.epoch = Some(epoch);
                self.server_revision = revision;
                self.synced = true;
                self.live = true;
                // An edit still in flight was not in the replay; send it
                // again under its original tag.
                let resubmit = match self.resubmit() {
                    Some(msg) => Some(msg),
                    None => self.promote(),
                };
                ClientOutcome::Joined {
                    session_id,
                    revision,
                    resubmit,
                }
            }
            ServerMessage::Presence { sessions, .. } => ClientOutcome::Presence(sessions),
            ServerMessage::Error { kind, detail } => {
                let edit_rejected = matches!(kind.as_str(), "outOfRange" | "rejected");
                let recover = if edit_rejected && self.in_flight.is_some() {
                    // The local text holds an edit the server refused.
                    Some(ClientMessage::Snapshot)
                } else {
                    None
                };
                ClientOutcome::Error {
                    kind,
                    detail,
                    recover,
                }
            }
            ServerMessage::Pong => ClientOutcome::Pong,
        }
    }

    fn apply_ack(
        &mut self,
        revision: u64,
        operation: Edit,
        author_id: String,
        correlation: Option<String>,
    ) -> ClientOutcome {
        let ours = match (&self.in_flight, &correlation) {
            (Some(f), Some(tag)) => &f.correlation == tag,
            _ => false,
        };
        if ours && revision <= self.server_revision {
            // Re-acknowledgement of a resubmission the server had already
            // sequenced; its effect is in the text we hold.
            self.in_flight = None;
            let next = self.promote();
            return ClientOutcome::Acked { revision, next };
        }
        if revision <= self.server_revision {
            return ClientOutcome::Duplicate { revision };
        }
        if revision > self.server_revision + 1 {
            return ClientOutcome::Gap {
                expected: self.server_revision + 1,
                resync: ClientMessage::Resync {
                    last_revision: self.server_revision,
                },
            };
        }

        self.server_revision = revision;
        if ours {
            self.in_flight = None;
            let next = self.promote();
            return ClientOutcome::Acked { revision, next };
        }

        let me = self.participant_id.clone().unwrap_or_default();
        let mut remote = Operation::new(operation, revision - 1, author_id);
        if let Some(f) = &mut self.in_flight {
            let (local, rebased) = transform_pair(&Operation::new(f.edit.clone(), 0, me.clone()), &remote);
            f.edit = local;
            remote.edit = rebased;
        }
        for pending in self.buffer.iter_mut() {
            let (local, rebased) = transform_pair(&Operation::new(pending.clone(), 0, me.clone()), &remote);
            *pending = local;
            remote.edit = rebased;
        }
        if let Err(e) = self.document.apply(&remote.edit) {
            log::error!("Remote edit r{revision} does not apply locally: {e}");
            return ClientOutcome::Gap {
                expected: revision,
                resync: ClientMessage::Snapshot,
            };
        }
        ClientOutcome::Remote {
            revision,
            author_id: remote.author_id,
            edit: remote.edit,
        }
    }

    /// Move the next buffered edit in flight once joined. Edits that
    /// collapsed to no-ops while buffered are dropped.
    fn promote(&mut self) -> Option<ClientMessage> {
        if !self.live {
            return None;
        }
        while let Some(edit) = self.buffer.pop_front() {
            if !edit.is_noop() {
                return Some(self.send(edit));
            }
        }
        None
    }

    fn send(&mut self, edit: Edit) -> ClientMessage {
        self.seq += 1;
        let correlation = format!("{}:{}", self.nonce, self.seq);
        self.in_flight = Some(InFlight {
            edit: edit.clone(),
            correlation: correlation.clone(),
        });
        ClientMessage::Op {
            base_revision: self.server_revision,
            operation: edit,
            correlation: Some(correlation),
        }
    }

    pub fn text(&self) -> &str {
        self.document.text()
    }

    pub fn len(&self) -> usize {
        self.document.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }

    pub fn server_revision(&self) -> u64 {
        self.server_revision
    }

    /// Unacknowledged local edits.
    pub fn pending(&self) -> usize {
        self.buffer.len() + usize::from(self.in_flight.is_some())
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn epoch(&self) -> Option<Uuid> {
        self.epoch
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Joined {
        session_id: Uuid,
        participant_id: String,
        revision: u64,
    },
    /// Our edit was sequenced
    Acked { revision: u64 },
    RemoteEdit {
        revision: u64,
        author_id: String,
        edit: Edit,
    },
    Snapshot {
        revision: u64,
        reason: SnapshotReason,
        discarded: usize,
    },
    Presence(Vec<PresenceEntry>),
    Error { kind: String, detail: String },
    Pong,
    Disconnected,
}

/// The sync client.
///
/// Connects to `ws://host/ws`, joins one room and keeps a [`ClientDocument`]
/// in step with it. Reconnecting rejoins with the last known revision.
pub struct SyncClient {
    url: String,
    room_id: String,
    /// Sent as the identity header, standing in for an auth proxy
    header_identity: Option<String>,
    document: Arc<Mutex<ClientDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(
        url: impl Into<String>,
        room_id: impl Into<String>,
        participant_id: Option<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            url: url.into(),
            room_id: room_id.into(),
            header_identity: None,
            document: Arc::new(Mutex::new(ClientDocument::new(participant_id))),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Present `participant_id` in the handshake header instead of the
    /// `join` message.
    pub fn with_header_identity(mut self, participant_id: impl Into<String>) -> Self {
        self.header_identity = Some(participant_id.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join. Spawns the socket reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::InvalidMessageType(e.to_string()))?;
        if let Some(id) = &self.header_identity {
            let value = HeaderValue::from_str(id)
                .map_err(|e| ProtocolError::InvalidMessageType(e.to_string()))?;
            request.headers_mut().insert(PARTICIPANT_HEADER, value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connection to {} failed: {e}", self.url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        let join = self.document.lock().await.join_message(&self.room_id);
        send_message(&out_tx, &join).await?;
        self.outgoing_tx = Some(out_tx.clone());

        // Reader task: apply server messages to the document
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let document = self.document.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let server_msg = match ServerMessage::decode(text.as_str()) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Undecodable server frame: {e}");
                        continue;
                    }
                };

                let outcome = document.lock().await.apply_server(server_msg);
                let (reply, event) = match outcome {
                    ClientOutcome::Acked { revision, next } => (next, Some(SyncEvent::Acked { revision })),
                    ClientOutcome::Remote {
                        revision,
                        author_id,
                        edit,
                    } => (
                        None,
                        Some(SyncEvent::RemoteEdit {
                            revision,
                            author_id,
                            edit,
                        }),
                    ),
                    ClientOutcome::Duplicate { revision } => {
                        log::trace!("Skipping replayed r{revision}");
                        (None, None)
                    }
                    ClientOutcome::Gap { expected, resync } => {
                        log::debug!("Missing r{expected}; resyncing");
                        (Some(resync), None)
                    }
                    ClientOutcome::Snapshot {
                        revision,
                        reason,
                        discarded,
                    } => (
                        None,
                        Some(SyncEvent::Snapshot {
                            revision,
                            reason,
                            discarded,
                        }),
                    ),
                    ClientOutcome::Joined {
                        session_id,
                        revision,
                        resubmit,
                    } => {
                        *state.write().await = ConnectionState::Joined;
                        let participant_id = document
                            .lock()
                            .await
                            .participant_id()
                            .unwrap_or_default()
                            .to_string();
                        (
                            resubmit,
                            Some(SyncEvent::Joined {
                                session_id,
                                participant_id,
                                revision,
                            }),
                        )
                    }
                    ClientOutcome::Presence(sessions) => (None, Some(SyncEvent::Presence(sessions))),
                    ClientOutcome::Error {
                        kind,
                        detail,
                        recover,
                    } => (recover, Some(SyncEvent::Error { kind, detail })),
                    ClientOutcome::Pong => (None, Some(SyncEvent::Pong)),
                };

                if let Some(reply) = reply {
                    if send_message(&out_tx, &reply).await.is_err() {
                        break;
                    }
                }
                if let Some(event) = event {
                    emit(&event_tx, event);
                }
            }

            // Connection lost
            document.lock().await.connection_lost();
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Apply a local edit and send it when nothing else is in flight.
    ///
    /// While disconnected the edit stays pending until the next join.
    pub async fn edit(&self, edit: Edit) -> Result<(), CollabError> {
        let msg = self.document.lock().await.local_edit(edit)?;
        match (msg, self.sender().await) {
            (Some(msg), Some(tx)) => send_message(&tx, &msg).await,
            _ => Ok(()),
        }
    }

    pub async fn insert(&self, position: usize, text: impl Into<String>) -> Result<(), CollabError> {
        self.edit(Edit::insert(position, text)).await
    }

    pub async fn delete(&self, position: usize, length: usize) -> Result<(), CollabError> {
        self.edit(Edit::delete(position, length)).await
    }

    pub async fn move_cursor(
        &self,
        position: usize,
        selection_end: Option<usize>,
    ) -> Result<(), CollabError> {
        self.send(ClientMessage::Cursor {
            position,
            selection_end,
        })
        .await
    }

    pub async fn request_snapshot(&self) -> Result<(), CollabError> {
        self.send(ClientMessage::Snapshot).await
    }

    /// Ask for everything after the last revision this client has seen.
    pub async fn resync(&self) -> Result<(), CollabError> {
        let last_revision = self.document.lock().await.server_revision();
        self.send(ClientMessage::Resync { last_revision }).await
    }

    pub async fn ping(&self) -> Result<(), CollabError> {
        self.send(ClientMessage::Ping).await
    }

    pub async fn leave(&self) -> Result<(), CollabError> {
        self.send(ClientMessage::Leave).await
    }

    /// Close the socket. Pending edits are kept for the next `connect`.
    pub async fn disconnect(&mut self) {
        self.document.lock().await.connection_lost();
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn text(&self) -> String {
        self.document.lock().await.text().to_string()
    }

    pub async fn revision(&self) -> u64 {
        self.document.lock().await.server_revision()
    }

    pub async fn pending(&self) -> usize {
        self.document.lock().await.pending()
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.document.lock().await.session_id()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn sender(&self) -> Option<mpsc::Sender<Message>> {
        match *self.state.read().await {
            ConnectionState::Disconnected | ConnectionState::Connecting => None,
            _ => self.outgoing_tx.clone(),
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), CollabError> {
        match self.sender().await {
            Some(tx) => send_message(&tx, &msg).await,
            None => Err(ProtocolError::ConnectionClosed.into()),
        }
    }
}

async fn send_message(tx: &mpsc::Sender<Message>, msg: &ClientMessage) -> Result<(), CollabError> {
    let text = msg.encode()?;
    tx.send(Message::Text(text.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed.into())
}

fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = tx.try_send(event) {
        log::debug!("Sync event dropped: {e}");
    }
}
