//! Error taxonomy for the editing engine.

/// Errors raised while validating, transforming or applying an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// The operation addresses positions outside the document.
    OutOfRange {
        position: usize,
        length: usize,
        doc_len: usize,
    },
    /// The requested revision is no longer (or not yet) in the log.
    RevisionNotFound {
        requested: u64,
        horizon: u64,
        head: u64,
    },
    /// Malformed or semantically invalid operation.
    Rejected(String),
    /// Document and log disagree; the room can no longer be trusted.
    RoomCorruption(String),
}

impl OtError {
    /// Wire name of the error kind (`error.kind` in outbound messages).
    pub fn kind(&self) -> &'static str {
        match self {
            OtError::OutOfRange { .. } => "outOfRange",
            OtError::RevisionNotFound { .. } => "revisionNotFound",
            OtError::Rejected(_) => "rejected",
            OtError::RoomCorruption(_) => "roomCorruption",
        }
    }

    /// Whether the error invalidates the whole room.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OtError::RoomCorruption(_))
    }
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::OutOfRange {
                position,
                length,
                doc_len,
            } => write!(
                f,
                "range {position}..{} is outside document of length {doc_len}",
                position + length
            ),
            OtError::RevisionNotFound {
                requested,
                horizon,
                head,
            } => write!(
                f,
                "revision {requested} not retained (horizon {horizon}, head {head})"
            ),
            OtError::Rejected(reason) => write!(f, "operation rejected: {reason}"),
            OtError::RoomCorruption(reason) => write!(f, "room corrupted: {reason}"),
        }
    }
}

impl std::error::Error for OtError {}
