//! Catch-up for sessions that (re)join with a known revision.
//!
//! A session presenting revision `L` either gets the missing entries
//! `(L, head]` replayed as `opAck` frames, or a full snapshot when a replay
//! is impossible or too large. The snapshot carries the reason so the client
//! knows whether its unacknowledged edits are lost.

use std::collections::{BTreeMap, HashMap};

use dojo_core::{Document, LogRange, OperationLog};
use uuid::Uuid;

use crate::protocol::{ServerMessage, SnapshotReason};

/// What a catching-up session is sent.
#[derive(Debug, Clone)]
pub enum ResyncPlan<'a> {
    /// Entries after the presented revision, oldest first
    Replay(LogRange<'a>),
    Snapshot(SnapshotReason),
}

/// What the session claims to have seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResyncRequest {
    pub last_revision: Option<u64>,
    /// Room incarnation the revision belongs to, when known
    pub epoch: Option<Uuid>,
}

/// Decide between replay and snapshot.
pub fn plan<'a>(
    log: &'a OperationLog,
    request: ResyncRequest,
    room_epoch: Uuid,
    max_replay: usize,
) -> ResyncPlan<'a> {
    let Some(last) = request.last_revision else {
        return ResyncPlan::Snapshot(SnapshotReason::Initial);
    };
    if request.epoch.is_some_and(|e| e != room_epoch) {
        return ResyncPlan::Snapshot(SnapshotReason::EpochChanged);
    }
    if last > log.head() {
        return ResyncPlan::Snapshot(SnapshotReason::AheadOfServer);
    }
    match log.since(last) {
        Ok(range) if range.len() <= max_replay => ResyncPlan::Replay(range),
        Ok(_) => ResyncPlan::Snapshot(SnapshotReason::ReplayTooLarge),
        Err(_) => ResyncPlan::Snapshot(SnapshotReason::HistoryTruncated),
    }
}

/// Correlation tags of retained log entries, for echoing on replay and for
/// recognising resubmissions.
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    tags: BTreeMap<u64, String>,
    revisions: HashMap<String, u64>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, revision: u64, correlation: Option<String>) {
        if let Some(tag) = correlation {
            self.revisions.insert(tag.clone(), revision);
            self.tags.insert(revision, tag);
        }
    }

    pub fn get(&self, revision: u64) -> Option<&str> {
        self.tags.get(&revision).map(String::as_str)
    }

    /// Revision already sequenced under `tag`.
    pub fn revision_of(&self, tag: &str) -> Option<u64> {
        self.revisions.get(tag).copied()
    }

    /// Forget tags of entries no longer in the log.
    pub fn prune(&mut self, horizon: u64) {
        let kept = self.tags.split_off(&(horizon + 1));
        for tag in self.tags.values() {
            self.revisions.remove(tag);
        }
        self.tags = kept;
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Render a plan into the frames sent to `participant_id`.
///
/// Replayed entries the participant authored carry their correlation tag so
/// an in-flight edit from before a disconnect is recognised as acknowledged.
pub fn render(
    plan: ResyncPlan<'_>,
    document: &Document,
    correlations: &CorrelationIndex,
    participant_id: &str,
) -> Vec<ServerMessage> {
    match plan {
        ResyncPlan::Snapshot(reason) => vec![ServerMessage::Snapshot {
            text: document.text().to_string(),
            revision: document.revision(),
            reason,
        }],
        ResyncPlan::Replay(range) => range
            .map(|entry| {
                let own = entry.operation.author_id == participant_id;
                let tag = own
                    .then(|| correlations.get(entry.revision).map(str::to_string))
                    .flatten();
                ServerMessage::op_ack(entry, tag)
            })
            .collect(),
    }
}
