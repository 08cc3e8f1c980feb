//! Composition and inversion.

use super::document::{apply, Document};
use super::operation::{byte_offset, char_len, Operation};

/// Merge two consecutive operations into one, when they are adjacent and of
/// the same kind.
///
/// `op2` must have been generated against the result of `op1`. Returns
/// `None` when the pair cannot be expressed as a single operation; callers
/// keep both in that case.
pub fn compose(op1: &Operation, op2: &Operation) -> Option<Operation> {
    match (op1, op2) {
        (Operation::Retain { .. }, _) => Some(op2.clone()),
        (_, Operation::Retain { .. }) => Some(op1.clone()),

        (
            Operation::Insert {
                position: p1,
                content: c1,
                author: a1,
                timestamp: t1,
            },
            Operation::Insert {
                position: p2,
                content: c2,
                author: a2,
                ..
            },
        ) if a1 == a2 => {
            // Second insert must land inside or at either edge of the first.
            if p2 < p1 || *p2 > p1 + char_len(c1) {
                return None;
            }
            let split = byte_offset(c1, p2 - p1);
            let mut content = String::with_capacity(c1.len() + c2.len());
            content.push_str(&c1[..split]);
            content.push_str(c2);
            content.push_str(&c1[split..]);
            Some(Operation::Insert {
                position: *p1,
                content,
                author: *a1,
                timestamp: *t1,
            })
        }

        (
            Operation::Delete {
                position: p1,
                length: l1,
                author: a1,
                timestamp: t1,
            },
            Operation::Delete {
                position: p2,
                length: l2,
                author: a2,
                ..
            },
        ) if a1 == a2 => {
            let position = if p2 == p1 {
                // forward delete
                *p1
            } else if p2 + l2 == *p1 {
                // backspace
                *p2
            } else {
                return None;
            };
            Some(Operation::Delete {
                position,
                length: l1 + l2,
                author: *a1,
                timestamp: *t1,
            })
        }

        _ => None,
    }
}

/// Build the operation that undoes `op`.
///
/// `doc` is the document *before* `op` was applied; a delete can only be
/// inverted with the text it removed. Returns `None` when `op` does not
/// apply to `doc`.
pub fn invert(op: &Operation, doc: &Document) -> Option<Operation> {
    match op {
        Operation::Retain { .. } => Some(op.clone()),

        Operation::Insert {
            position,
            content,
            author,
            timestamp,
        } => {
            if *position > doc.len() {
                return None;
            }
            Some(Operation::Delete {
                position: *position,
                length: char_len(content),
                author: *author,
                timestamp: *timestamp,
            })
        }

        Operation::Delete {
            position,
            length,
            author,
            timestamp,
        } => doc.slice(*position, *length).map(|removed| Operation::Insert {
            position: *position,
            content: removed.to_owned(),
            author: *author,
            timestamp: *timestamp,
        }),

        Operation::Sequence(parts) => {
            let mut state = doc.clone();
            let mut inverses = Vec::with_capacity(parts.len());
            for part in parts {
                inverses.push(invert(part, &state)?);
                state = apply(&state, part).ok()?;
            }
            inverses.reverse();
            Some(Operation::sequence(inverses))
        }
    }
}
