//! Fan-out of encoded frames to the sessions of one room.
//!
//! Each session owns a bounded outbox (`mpsc` of [`Frame`]s) drained by its
//! connection task. A frame is encoded once and shared by reference count
//! between all recipients. A session whose outbox is full is reported back
//! to the caller as lagging; the room drops it and the client recovers
//! through resync on reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::{Frame, ProtocolError, ServerMessage};

/// Sending half of a session outbox.
pub type OutboxSender = mpsc::Sender<Frame>;
/// Receiving half, drained by the connection task.
pub type OutboxReceiver = mpsc::Receiver<Frame>;

/// Create a session outbox holding at most `capacity` frames.
pub fn outbox(capacity: usize) -> (OutboxSender, OutboxReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Counters updated on the hot path without locking.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Result of handing one frame to one outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbox full: the session is lagging
    Full,
    /// Connection task is gone
    Closed,
    /// No such session
    Unknown,
}

impl Delivery {
    pub fn is_queued(&self) -> bool {
        matches!(self, Delivery::Queued)
    }
}

/// The outboxes of all sessions in a room.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    members: HashMap<Uuid, OutboxSender>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, session_id: Uuid, outbox: OutboxSender) {
        self.members.insert(session_id, outbox);
    }

    /// Remove a session; dropping the returned sender closes its outbox once
    /// queued frames are drained.
    pub fn remove(&mut self, session_id: &Uuid) -> Option<OutboxSender> {
        self.members.remove(session_id)
    }

    pub fn contains(&self, session_id: &Uuid) -> bool {
        self.members.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Queue a frame for a single session.
    pub fn send_to(&self, session_id: &Uuid, frame: Frame) -> Delivery {
        match self.members.get(session_id) {
            Some(tx) => self.deliver(tx, frame),
            None => Delivery::Unknown,
        }
    }

    /// Queue a frame for every session except `except`.
    ///
    /// Returns the sessions that could not take the frame.
    pub fn broadcast(&self, frame: &Frame, except: Option<&Uuid>) -> Vec<Uuid> {
        let mut failed = Vec::new();
        for (id, tx) in &self.members {
            if Some(id) == except {
                continue;
            }
            if !self.deliver(tx, frame.clone()).is_queued() {
                failed.push(*id);
            }
        }
        failed
    }

    /// Encode once, then [`broadcast`](Self::broadcast).
    pub fn broadcast_message(
        &self,
        msg: &ServerMessage,
        except: Option<&Uuid>,
    ) -> Result<Vec<Uuid>, ProtocolError> {
        let frame = msg.encode()?;
        Ok(self.broadcast(&frame, except))
    }

    /// Close every outbox.
    pub fn clear(&mut self) -> usize {
        let n = self.members.len();
        self.members.clear();
        n
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.members.len(),
        }
    }

    fn deliver(&self, tx: &OutboxSender, frame: Frame) -> Delivery {
        match tx.try_send(frame) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Closed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Frame {
        Frame::from(s)
    }

    #[tokio::test]
    async fn test_add_remove() {
        let mut group = BroadcastGroup::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = outbox(4);
        group.add(id, tx);
        assert!(group.contains(&id));
        assert_eq!(group.len(), 1);

        assert!(group.remove(&id).is_some());
        assert!(group.is_empty());
        assert_eq!(group.send_to(&id, frame("x")), Delivery::Unknown);
    }

    #[tokio::test]
    async fn test_fan_out_skips_originator() {
        let mut group = BroadcastGroup::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut receivers = Vec::new();
        for id in &ids {
            let (tx, rx) = outbox(4);
            group.add(*id, tx);
            receivers.push(rx);
        }

        let failed = group.broadcast(&frame("hello"), Some(&ids[0]));
        assert!(failed.is_empty());

        assert!(receivers[0].try_recv().is_err());
        for rx in receivers.iter_mut().skip(1) {
            let got = rx.recv().await.unwrap();
            assert_eq!(&*got, "hello");
        }
    }

    #[tokio::test]
    async fn test_shared_frame_not_copied() {
        let mut group = BroadcastGroup::new();
        let (tx1, mut rx1) = outbox(4);
        let (tx2, mut rx2) = outbox(4);
        group.add(Uuid::new_v4(), tx1);
        group.add(Uuid::new_v4(), tx2);

        let f = frame("shared");
        group.broadcast(&f, None);
        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_full_outbox_reported_as_lagging() {
        let mut group = BroadcastGroup::new();
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        let (slow_tx, _slow_rx) = outbox(1);
        let (fast_tx, mut fast_rx) = outbox(8);
        group.add(slow, slow_tx);
        group.add(fast, fast_tx);

        assert!(group.broadcast(&frame("1"), None).is_empty());
        let failed = group.broadcast(&frame("2"), None);
        assert_eq!(failed, vec![slow]);
        assert_eq!(&*fast_rx.recv().await.unwrap(), "1");
        assert_eq!(&*fast_rx.recv().await.unwrap(), "2");

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_sessions, 2);
    }

    #[tokio::test]
    async fn test_closed_outbox() {
        let mut group = BroadcastGroup::new();
        let id = Uuid::new_v4();
        let (tx, rx) = outbox(4);
        group.add(id, tx);
        drop(rx);
        assert_eq!(group.send_to(&id, frame("x")), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_broadcast_message_encodes() {
        let mut group = BroadcastGroup::new();
        let (tx, mut rx) = outbox(4);
        group.add(Uuid::new_v4(), tx);
        group.broadcast_message(&ServerMessage::Pong, None).unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), r#"{"type":"pong"}"#);
    }

    #[tokio::test]
    async fn test_clear_closes_outboxes() {
        let mut group = BroadcastGroup::new();
        let (tx, mut rx) = outbox(4);
        group.add(Uuid::new_v4(), tx);
        assert_eq!(group.clear(), 1);
        assert!(rx.recv().await.is_none());
    }
}
