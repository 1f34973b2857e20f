//! Edit operations addressed in Unicode code points.
//!
//! Wire shape (JSON):
//! ```text
//! { "kind": "insert", "position": 3, "text": "abc" }
//! { "kind": "delete", "position": 3, "length": 2 }
//! ```

use serde::{Deserialize, Serialize};

/// A single position-addressed text edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Edit {
    /// Insert `text` before the code point at `position`.
    Insert { position: usize, text: String },
    /// Remove `length` code points starting at `position`.
    Delete { position: usize, length: usize },
}

impl Edit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Edit::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Edit::Delete { position, length }
    }

    /// The canonical no-op: an empty insert at `position`.
    pub fn noop(position: usize) -> Self {
        Edit::Insert {
            position,
            text: String::new(),
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// Number of code points inserted or removed.
    pub fn span(&self) -> usize {
        match self {
            Edit::Insert { text, .. } => text.chars().count(),
            Edit::Delete { length, .. } => *length,
        }
    }

    /// End of the addressed range (`position + length` for deletes).
    pub fn end(&self) -> usize {
        match self {
            Edit::Insert { position, .. } => *position,
            Edit::Delete { position, length } => position + length,
        }
    }

    pub fn is_noop(&self) -> bool {
        match self {
            Edit::Insert { text, .. } => text.is_empty(),
            Edit::Delete { length, .. } => *length == 0,
        }
    }

    /// Document length after applying this edit to a document of `len`.
    pub fn resulting_len(&self, len: usize) -> usize {
        match self {
            Edit::Insert { .. } => len + self.span(),
            Edit::Delete { length, .. } => len.saturating_sub(*length),
        }
    }
}

/// An edit together with the revision it was authored against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub edit: Edit,
    pub base_revision: u64,
    pub author_id: String,
}

impl Operation {
    pub fn new(edit: Edit, base_revision: u64, author_id: impl Into<String>) -> Self {
        Self {
            edit,
            base_revision,
            author_id: author_id.into(),
        }
    }

    /// Same author, new edit and base revision.
    pub fn rebased(&self, edit: Edit, base_revision: u64) -> Self {
        Self {
            edit,
            base_revision,
            author_id: self.author_id.clone(),
        }
    }
}
