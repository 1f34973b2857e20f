//! Per-room operation log and sequencer.
//!
//! ```text
//!  horizon            retained entries               head
//!     │   ┌──────────┬──────────┬─────┬──────────┐    │
//!     └──►│ rev h+1  │ rev h+2  │ ... │ rev head │◄───┘
//!         └──────────┴──────────┴─────┴──────────┘
//! ```
//!
//! Revision 0 is the empty document. Every accepted operation gets the next
//! revision; entries older than the retention window are compacted away and
//! the horizon moves forward. Replays are only possible from the horizon on.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::OtError;
use crate::operation::Operation;

/// Log retention configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum number of entries kept for replay. Default: 10,000.
    pub retention: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { retention: 10_000 }
    }
}

impl LogConfig {
    pub fn with_retention(retention: usize) -> Self {
        Self { retention }
    }
}

/// One accepted, already transformed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub revision: u64,
    pub operation: Operation,
    /// Milliseconds since the Unix epoch
    pub applied_at: u64,
    /// Document length (code points) after this entry was applied
    pub len_after: usize,
}

/// Lazy, restartable view over a contiguous slice of log entries.
///
/// Clone it to iterate the same range again.
#[derive(Debug, Clone)]
pub struct LogRange<'a> {
    inner: std::collections::vec_deque::Iter<'a, LogEntry>,
}

impl<'a> Iterator for LogRange<'a> {
    type Item = &'a LogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for LogRange<'_> {}

/// Append-only history of a room, indexed by revision.
#[derive(Debug, Clone)]
pub struct OperationLog {
    config: LogConfig,
    entries: VecDeque<LogEntry>,
    /// Revision preceding the oldest retained entry
    horizon: u64,
    /// Document length at `horizon`
    horizon_len: usize,
    head: u64,
}

impl OperationLog {
    /// Empty log for an empty document at revision 0.
    pub fn new(config: LogConfig) -> Self {
        Self::starting_at(config, 0, 0)
    }

    /// Log for a document restored at `revision` with `len` code points.
    ///
    /// Nothing before `revision` can be replayed.
    pub fn starting_at(config: LogConfig, revision: u64, len: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.retention.min(1024)),
            config,
            horizon: revision,
            horizon_len: len,
            head: revision,
        }
    }

    /// Apply `op` to `document` and record it under the next revision.
    ///
    /// Both advance together or not at all: a failed apply stores nothing.
    pub fn append(&mut self, document: &mut Document, op: Operation) -> Result<u64, OtError> {
        if document.revision() != self.head {
            return Err(OtError::RoomCorruption(format!(
                "document at revision {} but log head is {}",
                document.revision(),
                self.head
            )));
        }
        let revision = document.apply(&op.edit)?;
        self.entries.push_back(LogEntry {
            revision,
            operation: op,
            applied_at: now_millis(),
            len_after: document.len(),
        });
        self.head = revision;
        self.compact();
        Ok(revision)
    }

    /// Entries with revisions in `(from, to]`.
    pub fn range(&self, from: u64, to: u64) -> Result<LogRange<'_>, OtError> {
        if from < self.horizon || from > to {
            return Err(self.not_found(from));
        }
        if to > self.head {
            return Err(self.not_found(to));
        }
        let start = (from - self.horizon) as usize;
        let end = (to - self.horizon) as usize;
        Ok(LogRange {
            inner: self.entries.range(start..end),
        })
    }

    /// Entries after `from` up to the head.
    pub fn since(&self, from: u64) -> Result<LogRange<'_>, OtError> {
        self.range(from, self.head)
    }

    /// Document length (code points) at a retained revision.
    pub fn length_at(&self, revision: u64) -> Result<usize, OtError> {
        if revision == self.horizon {
            return Ok(self.horizon_len);
        }
        self.entry(revision)
            .map(|e| e.len_after)
            .ok_or_else(|| self.not_found(revision))
    }

    pub fn entry(&self, revision: u64) -> Option<&LogEntry> {
        if revision <= self.horizon || revision > self.head {
            return None;
        }
        self.entries.get((revision - self.horizon - 1) as usize)
    }

    /// Rebuild the document from revision 0.
    ///
    /// Only possible while nothing has been compacted away.
    pub fn replay(&self) -> Result<Document, OtError> {
        self.replay_to(self.head)
    }

    /// Rebuild the document as it was at `revision`.
    pub fn replay_to(&self, revision: u64) -> Result<Document, OtError> {
        if self.horizon != 0 {
            return Err(self.not_found(0));
        }
        let mut document = Document::new();
        for entry in self.range(0, revision)? {
            document.apply(&entry.operation.edit)?;
        }
        Ok(document)
    }

    /// Detect divergence between `document` and this log.
    pub fn verify(&self, document: &Document) -> Result<(), OtError> {
        if document.revision() != self.head {
            return Err(OtError::RoomCorruption(format!(
                "document revision {} differs from log head {}",
                document.revision(),
                self.head
            )));
        }
        let expected = self.length_at(self.head)?;
        if document.len() != expected {
            return Err(OtError::RoomCorruption(format!(
                "document length {} differs from logged length {expected} at revision {}",
                document.len(),
                self.head
            )));
        }
        Ok(())
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Oldest revision a replay can start from.
    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Whether `revision` can be replayed from.
    pub fn is_retained(&self, revision: u64) -> bool {
        revision >= self.horizon && revision <= self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn compact(&mut self) {
        while self.entries.len() > self.config.retention {
            if let Some(dropped) = self.entries.pop_front() {
                self.horizon = dropped.revision;
                self.horizon_len = dropped.len_after;
            }
        }
    }

    fn not_found(&self, requested: u64) -> OtError {
        OtError::RevisionNotFound {
            requested,
            horizon: self.horizon,
            head: self.head,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
