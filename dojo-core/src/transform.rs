//! Operational transformation of concurrent text edits.
//!
//! `transform(a, b)` rewrites `a` so that it applies on top of `b`, where both
//! were authored against the same document state. The four cases:
//!
//! | a \ b  | Insert                           | Delete                                 |
//! |--------|----------------------------------|----------------------------------------|
//! | Insert | shift right if b is before a; ties by author id | shift left past b; inside b → no-op at b's start |
//! | Delete | shift right if b is before a; grow if b is inside a | drop the overlap; shift left past b |
//!
//! Text inserted strictly inside a concurrently deleted range is deleted
//! with it on every replica (the insert collapses to a no-op, the delete
//! grows to cover it), which keeps `transform_pair` convergent.

use crate::document::check_bounds;
use crate::error::OtError;
use crate::oplog::OperationLog;
use crate::operation::{Edit, Operation};

/// Rewrite `edit` to apply after `against`.
///
/// `against_first` decides the order of two inserts at the same position.
pub fn transform(edit: &Edit, against: &Edit, against_first: bool) -> Edit {
    match (edit, against) {
        (Edit::Insert { position, text }, Edit::Insert { position: q, text: u }) => {
            if *q < *position || (*q == *position && against_first) {
                Edit::insert(position + u.chars().count(), text.clone())
            } else {
                edit.clone()
            }
        }
        (Edit::Insert { position, text }, Edit::Delete { position: q, length: m }) => {
            if *position <= *q {
                edit.clone()
            } else if *position >= q + m {
                Edit::insert(position - m, text.clone())
            } else {
                Edit::noop(*q)
            }
        }
        (Edit::Delete { position, length }, Edit::Insert { position: q, text: u }) => {
            let shift = u.chars().count();
            if *q <= *position {
                Edit::delete(position + shift, *length)
            } else if *q >= position + length {
                edit.clone()
            } else {
                Edit::delete(*position, length + shift)
            }
        }
        (Edit::Delete { position, length }, Edit::Delete { position: q, length: m }) => {
            let (p, n, q, m) = (*position, *length, *q, *m);
            let overlap = (p + n).min(q + m).saturating_sub(p.max(q));
            let before = if q < p { m.min(p - q) } else { 0 };
            let start = p - before;
            let remaining = n - overlap;
            if remaining == 0 {
                Edit::noop(start)
            } else {
                Edit::delete(start, remaining)
            }
        }
    }
}

/// Rebase a local and a remote edit against each other.
///
/// `remote` has already been sequenced by the server, so it wins ties when
/// the author ids are equal. Returns `(local', remote')` with
/// `apply(apply(s, local), remote') == apply(apply(s, remote), local')`.
pub fn transform_pair(local: &Operation, remote: &Operation) -> (Edit, Edit) {
    let remote_first = remote.author_id <= local.author_id;
    (
        transform(&local.edit, &remote.edit, remote_first),
        transform(&remote.edit, &local.edit, !remote_first),
    )
}

/// Move a cursor offset through an applied edit.
pub fn transform_position(position: usize, applied: &Edit) -> usize {
    match applied {
        Edit::Insert { position: q, text } => {
            if *q <= position {
                position + text.chars().count()
            } else {
                position
            }
        }
        Edit::Delete { position: q, length } => {
            if position <= *q {
                position
            } else if position >= q + length {
                position - length
            } else {
                *q
            }
        }
    }
}

/// Structural validation of a submitted edit.
pub fn validate(edit: &Edit, max_chars: usize) -> Result<(), OtError> {
    if edit.is_noop() {
        return Err(OtError::Rejected("empty edit".to_string()));
    }
    if edit.span() > max_chars {
        return Err(OtError::Rejected(format!(
            "edit spans {} code points, limit is {max_chars}",
            edit.span()
        )));
    }
    Ok(())
}

/// Transform a client operation over everything sequenced since its base.
///
/// The result is based on the log head and ready to append. Positions are
/// checked against the document as it was at the claimed base revision.
pub fn rebase(log: &OperationLog, op: &Operation) -> Result<Operation, OtError> {
    let head = log.head();
    if op.base_revision > head {
        return Err(OtError::Rejected(format!(
            "base revision {} is ahead of head {head}",
            op.base_revision
        )));
    }
    let base_len = log.length_at(op.base_revision)?;
    check_bounds(&op.edit, base_len)?;

    let mut edit = op.edit.clone();
    let intervening = log.range(op.base_revision, head)?;
    let skipped = intervening.len();
    for entry in intervening {
        let against_first = entry.operation.author_id <= op.author_id;
        edit = transform(&edit, &entry.operation.edit, against_first);
    }
    if skipped > 0 {
        log::debug!(
            "rebased {}'s edit over {skipped} operations ({} -> {head})",
            op.author_id,
            op.base_revision
        );
    }
    Ok(op.rebased(edit, head))
}
