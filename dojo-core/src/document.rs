//! Authoritative text buffer of a room.

use serde::{Deserialize, Serialize};

use crate::error::OtError;
use crate::operation::Edit;

/// Point-in-time copy of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
    pub revision: u64,
}

/// Text buffer plus the revision it reflects.
///
/// Positions are code-point offsets; the byte offset of a position is
/// resolved on every mutation, so the buffer stays a plain `String`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    text: String,
    /// Length in code points
    len: usize,
    revision: u64,
}

impl Document {
    /// Empty document at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Document restored from a checkpoint.
    pub fn from_snapshot(text: impl Into<String>, revision: u64) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self {
            text,
            len,
            revision,
        }
    }

    /// Apply an edit and advance the revision by one.
    ///
    /// Fails with [`OtError::OutOfRange`] without touching the buffer when
    /// the edit addresses positions past the end.
    pub fn apply(&mut self, edit: &Edit) -> Result<u64, OtError> {
        self.check_range(edit)?;
        match edit {
            Edit::Insert { position, text } => {
                let at = self.byte_offset(*position);
                self.text.insert_str(at, text);
                self.len += text.chars().count();
            }
            Edit::Delete { position, length } => {
                let start = self.byte_offset(*position);
                let end = self.byte_offset(position + length);
                self.text.replace_range(start..end, "");
                self.len -= length;
            }
        }
        self.revision += 1;
        Ok(self.revision)
    }

    /// Validate an edit against the current length without applying it.
    pub fn check_range(&self, edit: &Edit) -> Result<(), OtError> {
        check_bounds(edit, self.len)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            text: self.text.clone(),
            revision: self.revision,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Length in code points.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte_offset(&self, position: usize) -> usize {
        if position == self.len {
            return self.text.len();
        }
        self.text
            .char_indices()
            .nth(position)
            .map_or(self.text.len(), |(idx, _)| idx)
    }
}

/// Check that `edit` addresses only positions within a document of `doc_len`.
pub fn check_bounds(edit: &Edit, doc_len: usize) -> Result<(), OtError> {
    let end = match edit {
        Edit::Insert { position, .. } => *position,
        Edit::Delete { position, length } => position.saturating_add(*length),
    };
    if end > doc_len {
        return Err(OtError::OutOfRange {
            position: edit.position(),
            length: end.saturating_sub(edit.position()),
            doc_len,
        });
    }
    Ok(())
}
