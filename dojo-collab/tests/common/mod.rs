//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use dojo_collab::protocol::{ClientMessage, ServerMessage};
use dojo_collab::{CheckpointStore, RoomRegistry, ServerConfig, SyncClient, SyncEvent, SyncServer};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// A server running on a free port.
pub struct TestServer {
    pub url: String,
    pub registry: Arc<RoomRegistry>,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let server = SyncServer::new(config).unwrap();
        Self::spawn(server).await
    }

    pub async fn with_store(config: ServerConfig, store: Arc<dyn CheckpointStore>) -> Self {
        Self::spawn(SyncServer::with_store(config, Some(store))).await
    }

    async fn spawn(server: SyncServer) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = server.registry().clone();
        let task = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        Self {
            url: format!("ws://{addr}/ws"),
            registry,
            task,
        }
    }

    /// Authoritative `(text, revision)` of a running room.
    pub async fn room_state(&self, room_id: &str) -> (String, u64) {
        let handle = self.registry.get(room_id).await.expect("room is running");
        let info = handle.inspect().await.unwrap();
        (info.snapshot.text, info.snapshot.revision)
    }
}

pub async fn connect_raw(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn connect_raw_as(url: &str, participant: &'static str) -> Ws {
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-participant-id", HeaderValue::from_static(participant));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

pub async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into())).await.unwrap();
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next server message, skipping control frames.
pub async fn recv(ws: &mut Ws) -> ServerMessage {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return ServerMessage::decode(text.as_str()).unwrap(),
                Some(Ok(Message::Close(_))) | None => panic!("connection closed"),
                Some(Err(e)) => panic!("socket error: {e}"),
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for a server message")
}

/// First server message matching `pred`; earlier ones are discarded.
pub async fn recv_until(ws: &mut Ws, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        let msg = recv(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

pub fn join(room: &str, participant: Option<&str>) -> ClientMessage {
    ClientMessage::Join {
        room_id: room.into(),
        participant_id: participant.map(str::to_string),
        last_revision: None,
        epoch: None,
    }
}

/// Join and consume frames up to `joined`.
pub async fn join_raw(ws: &mut Ws, room: &str, participant: Option<&str>) -> ServerMessage {
    send(ws, &join(room, participant)).await;
    recv_until(ws, |m| matches!(m, ServerMessage::Joined { .. })).await
}

/// Connected client whose `joined` has arrived.
pub async fn client(url: &str, room: &str, participant: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, room, Some(participant.to_string()));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_event(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    (client, events)
}

pub async fn next_event(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until every client has no pending edits and holds the same text as
/// the room. Returns that text.
pub async fn converge(server: &TestServer, room: &str, clients: &[&SyncClient]) -> String {
    let deadline = Instant::now() + WAIT;
    loop {
        let (text, revision) = server.room_state(room).await;
        let mut settled = true;
        for c in clients {
            if c.pending().await != 0 || c.revision().await != revision || c.text().await != text {
                settled = false;
                break;
            }
        }
        if settled {
            return text;
        }
        if Instant::now() > deadline {
            let mut views = Vec::new();
            for c in clients {
                views.push((c.text().await, c.revision().await, c.pending().await));
            }
            panic!("clients did not converge on {text:?}@{revision}: {views:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the registry runs exactly `count` rooms.
pub async fn wait_rooms(registry: &RoomRegistry, count: usize) {
    let deadline = Instant::now() + WAIT;
    while registry.room_count().await != count {
        assert!(Instant::now() < deadline, "room count never reached {count}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
